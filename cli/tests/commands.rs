use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use quay_cli::Outcome;
use quay_cli::commands::{KvCommand, ValueKind, WatchArgs, run_kv, run_ready, run_watch};
use quay_engine::{EngineClient, EngineConfig};
use quay_kv::{KvStore, KvStoreExt, MemoryKvStore, WatchOptions};
use quay_resilience::{CancellationToken, ClusterError, RetryPolicy};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn policy() -> RetryPolicy {
    RetryPolicy::linear(2, Duration::from_millis(10))
}

async fn kv(store: &MemoryKvStore, command: KvCommand) -> (anyhow::Result<Outcome>, String) {
    let mut out = Vec::new();
    let result = run_kv(store, command, &policy(), &CancellationToken::new(), &mut out).await;
    (result, String::from_utf8(out).unwrap())
}

#[tokio::test]
async fn get_renders_typed_values() {
    let store = MemoryKvStore::new();
    store.put_string("flags/tls", "Yes").await.unwrap();
    store
        .put_object("routes/app", &json!({"host": "app.example.com"}))
        .await
        .unwrap();

    let (result, out) = kv(
        &store,
        KvCommand::Get {
            key: "flags/tls".to_string(),
            kind: ValueKind::Bool,
        },
    )
    .await;
    assert_eq!(result.unwrap(), Outcome::Success);
    assert_eq!(out, "true\n");

    let (_, out) = kv(
        &store,
        KvCommand::Get {
            key: "routes/app".to_string(),
            kind: ValueKind::Json,
        },
    )
    .await;
    assert_eq!(out, "{\n  \"host\": \"app.example.com\"\n}\n");
}

#[tokio::test]
async fn get_missing_key_fails_with_not_found_cause() {
    let store = MemoryKvStore::new();

    let (result, out) = kv(
        &store,
        KvCommand::Get {
            key: "missing/key".to_string(),
            kind: ValueKind::String,
        },
    )
    .await;

    let err = result.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ClusterError>(),
        Some(ClusterError::NotFound { .. })
    ));
    assert!(out.is_empty());
}

#[tokio::test]
async fn exists_reports_absent_outcome() {
    let store = MemoryKvStore::new();
    store.put_string("present", "1").await.unwrap();

    let (present, _) = kv(&store, KvCommand::Exists { key: "present".to_string() }).await;
    let (absent, out) = kv(&store, KvCommand::Exists { key: "absent".to_string() }).await;

    assert_eq!(present.unwrap(), Outcome::Success);
    assert_eq!(absent.unwrap(), Outcome::Absent);
    assert_eq!(out, "false\n");
}

#[tokio::test]
async fn put_and_delete_prefix() {
    let store = MemoryKvStore::new();

    kv(
        &store,
        KvCommand::Put {
            key: "routes/a".to_string(),
            value: "10.0.0.1".to_string(),
        },
    )
    .await
    .0
    .unwrap();
    store.put_string("routes/b", "10.0.0.2").await.unwrap();
    assert_eq!(store.get_string("routes/a").await.unwrap(), "10.0.0.1");

    kv(
        &store,
        KvCommand::Delete {
            key: "routes/".to_string(),
            prefix: true,
        },
    )
    .await
    .0
    .unwrap();

    assert!(!store.exists("routes/a").await.unwrap());
    assert!(!store.exists("routes/b").await.unwrap());
}

#[tokio::test]
async fn watch_prints_changes_until_cancelled() {
    let store = Arc::new(MemoryKvStore::new());
    store.put_string("proxy/version", "1").await.unwrap();
    let cancel = CancellationToken::new();

    let writer = Arc::clone(&store);
    let canceller = cancel.clone();
    tokio::spawn(async move {
        // Give the watch time to deliver its initial snapshot.
        tokio::time::sleep(Duration::from_millis(100)).await;
        writer.put_string("proxy/version", "2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let mut out = Vec::new();
    let options = WatchOptions {
        wait_time: Duration::from_secs(5),
        retry: policy(),
    };
    let store: Arc<dyn KvStore> = store;
    let outcome = run_watch(
        store,
        WatchArgs {
            key: "proxy/version".to_string(),
            prefix: false,
        },
        options,
        &cancel,
        &mut out,
    )
    .await
    .unwrap();

    assert_eq!(outcome, Outcome::Success);
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "#1 index=1 proxy/version=1\n#2 index=2 proxy/version=2\n"
    );
}

#[tokio::test]
async fn ready_succeeds_against_converged_engine() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ID": "node-id",
            "Name": "node-1",
            "ServerVersion": "24.0.7"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/volumes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Volumes": [{"Name": "certs", "Driver": "local"}]
        })))
        .mount(&server)
        .await;
    let engine = EngineClient::new(EngineConfig {
        address: server.uri(),
        ..EngineConfig::default()
    })
    .unwrap();

    let mut out = Vec::new();
    let outcome = run_ready(&engine, Duration::from_secs(4), &CancellationToken::new(), &mut out)
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Success);
    assert_eq!(String::from_utf8(out).unwrap(), "ready\n");
}
