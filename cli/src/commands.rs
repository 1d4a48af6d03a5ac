//! `quay` subcommands.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use quay_consul::ConsulKvStore;
use quay_engine::{EngineClient, EngineConfig};
use quay_kv::{KvStore, KvStoreExt, WatchEvent, WatchOptions, WatchTarget, Watcher};
use quay_resilience::{CancellationToken, ClusterError, RetryPolicy, wait_until_ready};
use quay_secrets::{BearerToken, Credential, VaultAuth, load_credential};
use tokio::sync::mpsc;

use crate::config::QuayConfig;

#[derive(Debug, Parser)]
#[command(name = "quay", version, about = "Resilient cluster client and KV coordination tool")]
pub struct Cli {
    /// Config file (default: ./quay.toml or ~/.config/quay/config.toml)
    #[arg(long, short = 'c', global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Wait until the cluster engine is ready
    Ready(ReadyArgs),

    /// Read and write coordination-store keys
    Kv {
        #[command(subcommand)]
        command: KvCommand,
    },

    /// Print one line per change to a key or prefix until interrupted
    Watch(WatchArgs),
}

#[derive(Debug, Args)]
pub struct ReadyArgs {
    /// Seconds per readiness stage; 0 probes once (default: readiness.timeout_secs)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum KvCommand {
    /// Read a key as the given type
    Get {
        key: String,

        #[arg(long = "as", value_enum, default_value_t = ValueKind::String)]
        kind: ValueKind,
    },

    /// Write a string value
    Put { key: String, value: String },

    /// Delete a key, or every key under it with --prefix
    Delete {
        key: String,

        #[arg(long)]
        prefix: bool,
    },

    /// Exit 0 if the key exists, 2 if it does not
    Exists { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ValueKind {
    String,
    Bool,
    Int,
    Long,
    Double,
    Json,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    pub key: String,

    /// Watch every key under KEY
    #[arg(long)]
    pub prefix: bool,
}

/// How a successful command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// `kv exists` found nothing.
    Absent,
}

impl From<Outcome> for ExitCode {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => ExitCode::SUCCESS,
            Outcome::Absent => ExitCode::from(2),
        }
    }
}

/// Dispatch `command` against the services named in `config`.
pub async fn run(
    command: Command,
    config: &QuayConfig,
    cancel: &CancellationToken,
    out: &mut (dyn Write + Send),
) -> Result<Outcome> {
    match command {
        Command::Ready(args) => {
            let engine = engine_client(config).await?;
            let timeout = args
                .timeout
                .map_or_else(|| config.readiness_timeout(), Duration::from_secs);
            run_ready(&engine, timeout, cancel, out).await
        }
        Command::Kv { command } => {
            let store = consul_store(config)?;
            run_kv(&store, command, &config.retry_policy(), cancel, out).await
        }
        Command::Watch(args) => {
            let store: Arc<dyn KvStore> = Arc::new(consul_store(config)?);
            run_watch(store, args, config.watch_options(), cancel, out).await
        }
    }
}

fn consul_store(config: &QuayConfig) -> Result<ConsulKvStore> {
    ConsulKvStore::new(config.consul_config())
        .context("Failed to create coordination store client")
}

async fn engine_client(config: &QuayConfig) -> Result<EngineClient> {
    let token = match &config.vault.credential_path {
        Some(path) => Some(resolve_token(config, path).await?),
        None => None,
    };
    EngineClient::new(EngineConfig {
        address: config.engine.address.clone(),
        token,
        ..EngineConfig::default()
    })
    .context("Failed to create engine client")
}

async fn resolve_token(config: &QuayConfig, path: &Path) -> Result<BearerToken> {
    let credential = load_credential(path)
        .with_context(|| format!("Failed to load credential from {}", path.display()))?;
    let address = match (&credential, &config.vault.address) {
        (Credential::AppRole { .. }, None) => {
            bail!("vault.address is required to exchange an approle credential")
        }
        (_, address) => address.clone().unwrap_or_default(),
    };
    VaultAuth::new(address)?
        .token(&credential)
        .await
        .context("Failed to obtain engine token")
}

pub async fn run_ready(
    engine: &EngineClient,
    timeout: Duration,
    cancel: &CancellationToken,
    out: &mut (dyn Write + Send),
) -> Result<Outcome> {
    wait_until_ready(engine, timeout, cancel)
        .await
        .context("Cluster engine did not become ready")?;
    writeln!(out, "ready")?;
    Ok(Outcome::Success)
}

/// Typed KV operations. Network faults are retried with `policy`; missing keys
/// and malformed values are not.
pub async fn run_kv(
    store: &dyn KvStore,
    command: KvCommand,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    out: &mut (dyn Write + Send),
) -> Result<Outcome> {
    match command {
        KvCommand::Get { key, kind } => {
            let path = key.as_str();
            let rendered = policy
                .invoke_cancellable(move || render(store, path, kind), cancel)
                .await
                .with_context(|| format!("Failed to read '{key}'"))?;
            writeln!(out, "{rendered}")?;
            Ok(Outcome::Success)
        }
        KvCommand::Put { key, value } => {
            let (path, value) = (key.as_str(), value.as_str());
            policy
                .invoke_cancellable(move || store.put_string(path, value), cancel)
                .await
                .with_context(|| format!("Failed to write '{key}'"))?;
            Ok(Outcome::Success)
        }
        KvCommand::Delete { key, prefix } => {
            let path = key.as_str();
            let result = if prefix {
                policy
                    .invoke_cancellable(move || store.delete_prefix(path), cancel)
                    .await
            } else {
                policy
                    .invoke_cancellable(move || store.delete(path), cancel)
                    .await
            };
            result.with_context(|| format!("Failed to delete '{key}'"))?;
            Ok(Outcome::Success)
        }
        KvCommand::Exists { key } => {
            let path = key.as_str();
            let exists = policy
                .invoke_cancellable(move || store.exists(path), cancel)
                .await
                .with_context(|| format!("Failed to check '{key}'"))?;
            writeln!(out, "{exists}")?;
            Ok(if exists {
                Outcome::Success
            } else {
                Outcome::Absent
            })
        }
    }
}

async fn render(
    store: &dyn KvStore,
    key: &str,
    kind: ValueKind,
) -> quay_resilience::Result<String> {
    Ok(match kind {
        ValueKind::String => store.get_string(key).await?,
        ValueKind::Bool => store.get_bool(key).await?.to_string(),
        ValueKind::Int => store.get_i32(key).await?.to_string(),
        ValueKind::Long => store.get_i64(key).await?.to_string(),
        ValueKind::Double => store.get_f64(key).await?.to_string(),
        ValueKind::Json => {
            let value: serde_json::Value = store.get_object(key).await?;
            serde_json::to_string_pretty(&value)
                .map_err(|err| ClusterError::format(key, "JSON document", err.to_string()))?
        }
    })
}

/// Watch until `cancel` fires, writing one line per handler call.
pub async fn run_watch(
    store: Arc<dyn KvStore>,
    args: WatchArgs,
    options: WatchOptions,
    cancel: &CancellationToken,
    out: &mut (dyn Write + Send),
) -> Result<Outcome> {
    let target = if args.prefix {
        WatchTarget::prefix(args.key)
    } else {
        WatchTarget::key(args.key)
    };

    let (tx, mut lines) = mpsc::unbounded_channel();
    let handler = move |event: &WatchEvent| -> quay_resilience::Result<()> {
        // The receiver outlives the watch unless we are already shutting down.
        let _ = tx.send(describe(event));
        Ok(())
    };

    let handle = Watcher::new(store)
        .start(target.clone(), handler, options, cancel.clone())
        .await
        .with_context(|| format!("Failed to start watch on {target}"))?;

    // Drains until the handler is dropped, which happens when the watch task
    // ends for any reason.
    while let Some(line) = lines.recv().await {
        writeln!(out, "{line}")?;
        out.flush()?;
    }

    match handle.join().await {
        Ok(()) | Err(ClusterError::Cancelled) => Ok(Outcome::Success),
        Err(err) => Err(err).with_context(|| format!("Watch on {target} failed")),
    }
}

fn describe(event: &WatchEvent) -> String {
    match &event.target {
        WatchTarget::Key(key) => {
            let value = event
                .entry()
                .map(|entry| String::from_utf8_lossy(&entry.value).into_owned());
            match value {
                Some(value) => format!("#{} index={} {key}={value}", event.change, event.index),
                None => format!("#{} index={} {key} (absent)", event.change, event.index),
            }
        }
        WatchTarget::Prefix(prefix) => format!(
            "#{} index={} {prefix} ({} keys)",
            event.change,
            event.index,
            event.entries.len()
        ),
    }
}
