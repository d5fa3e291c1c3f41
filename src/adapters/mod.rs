pub mod codex;

use crate::models::{ExecutionError, ExecutionRequest};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A fully resolved child-process invocation. The prompt travels on stdin and
/// never appears in `args`.
#[derive(Debug, Clone)]
pub struct ValidatedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub stdin: String,
}

pub trait Adapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn build_command(
        &self,
        request: &ExecutionRequest,
        binary_path: &str,
    ) -> Result<ValidatedCommand, ExecutionError>;

    /// Remediation shown when the binary cannot be found.
    fn install_hint(&self) -> &'static str;
}
