use crate::errors::{AppError, AppResult};
use crate::events::{Event, Usage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    Untrusted,
    OnFailure,
    OnRequest,
    Never,
}

impl ApprovalPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Untrusted => "untrusted",
            Self::OnFailure => "on-failure",
            Self::OnRequest => "on-request",
            Self::Never => "never",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    ReadOnly,
    WorkspaceWrite,
    DangerFullAccess,
}

impl SandboxMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read-only",
            Self::WorkspaceWrite => "workspace-write",
            Self::DangerFullAccess => "danger-full-access",
        }
    }
}

/// An absolute, symlink-resolved directory that passed [`crate::policy::PathGuard`].
///
/// There is no public constructor: the only way to obtain one is a successful
/// validation, so a raw caller path can never reach the child's argument list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CanonicalPath(PathBuf);

impl CanonicalPath {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl AsRef<Path> for CanonicalPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOptions {
    pub timeout_ms: u64,
    pub working_directory: Option<CanonicalPath>,
    pub structured_output: bool,
    pub full_auto: bool,
    pub approval_policy: Option<ApprovalPolicy>,
    pub sandbox: Option<SandboxMode>,
    pub skip_git_repo_check: bool,
    pub model: Option<String>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            working_directory: None,
            structured_output: false,
            full_auto: false,
            approval_policy: None,
            sandbox: None,
            skip_git_repo_check: false,
            model: None,
        }
    }
}

impl ExecutionOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    prompt: String,
    options: ExecutionOptions,
}

impl ExecutionRequest {
    pub fn new(prompt: impl Into<String>, options: ExecutionOptions) -> AppResult<Self> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(AppError::Config("Prompt cannot be empty".to_string()));
        }
        Ok(Self { prompt, options })
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    Timeout,
    OutputTooLarge,
    AuthenticationFailed,
    ExecutionFailed,
    InputWriteFailed,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::Timeout => "TIMEOUT",
            Self::OutputTooLarge => "OUTPUT_TOO_LARGE",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::InputWriteFailed => "INPUT_WRITE_FAILED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed execution as seen by the caller.
///
/// `details` is only guaranteed to be redacted once the error has passed
/// through the runner's finalize step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<String>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        let details = details.into();
        self.details = if details.trim().is_empty() {
            None
        } else {
            Some(details)
        };
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSuccess {
    pub events: Vec<Event>,
    pub final_message: String,
    pub files_changed: Vec<String>,
    pub commands_run: Vec<String>,
    pub thread_id: Option<String>,
    pub usage: Option<Usage>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

pub type ExecutionResult = Result<ExecutionSuccess, ExecutionError>;
