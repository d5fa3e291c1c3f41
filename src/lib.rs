//! Bounded, sandboxed execution of the Codex CLI.
//!
//! A [`Runner`] admits at most `max_concurrency` child processes through a
//! [`ConcurrencyGate`], feeds each one its prompt over stdin, caps and parses
//! its output, and turns every possible ending into exactly one
//! [`ExecutionResult`]. Working directories are confined by [`PathGuard`] and
//! error text is scrubbed by [`OutputSanitizer`] before it is returned.

pub mod adapters;
pub mod config;
pub mod errors;
pub mod events;
pub mod harness;
pub mod models;
pub mod policy;
pub mod redaction;
pub mod runner;
pub mod scheduler;

pub use crate::config::RunnerSettings;
pub use crate::errors::{AppError, AppResult};
pub use crate::events::{Event, EventKind, Item};
pub use crate::models::{
    ApprovalPolicy, CanonicalPath, ErrorKind, ExecutionError, ExecutionOptions, ExecutionRequest,
    ExecutionResult, ExecutionSuccess, SandboxMode,
};
pub use crate::policy::{PathGuard, PathValidation, PolicyEngine};
pub use crate::redaction::OutputSanitizer;
pub use crate::runner::Runner;
pub use crate::scheduler::{ConcurrencyGate, GatePermit};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs the global JSON subscriber. With a `log_dir` output goes to a
/// daily rolling `runner.log` there, otherwise to stderr.
pub fn init_tracing(log_dir: Option<&Path>) -> AppResult<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let result = match log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "runner.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_writer(non_blocking)
                .try_init()
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .try_init(),
    };

    result.map_err(|error| AppError::Internal(error.to_string()))
}
