//! Library half of the `quay` binary: configuration and subcommands.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod commands;
pub mod config;

pub use commands::{Cli, Command, Outcome, run};
pub use config::{ConfigLoader, QuayConfig};
