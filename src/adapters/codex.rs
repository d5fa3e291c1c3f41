use super::{Adapter, ValidatedCommand};
use crate::models::{ErrorKind, ExecutionError, ExecutionRequest};
use std::collections::BTreeMap;

const SUBCOMMAND: &str = "exec";
const STDIN_MARKER: &str = "-";

#[derive(Debug, Default, Clone, Copy)]
pub struct CodexAdapter;

impl Adapter for CodexAdapter {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn build_command(
        &self,
        request: &ExecutionRequest,
        binary_path: &str,
    ) -> Result<ValidatedCommand, ExecutionError> {
        let options = request.options();
        let mut args = vec![SUBCOMMAND.to_string()];

        if options.structured_output {
            args.push("--json".to_string());
        }

        // Codex refuses --full-auto together with an explicit approval
        // policy; the explicit policy takes precedence.
        if let Some(policy) = options.approval_policy {
            args.push("--ask-for-approval".to_string());
            args.push(policy.as_str().to_string());
        } else if options.full_auto {
            args.push("--full-auto".to_string());
        }

        if let Some(sandbox) = options.sandbox {
            args.push("--sandbox".to_string());
            args.push(sandbox.as_str().to_string());
        }

        if let Some(cwd) = &options.working_directory {
            let cwd = cwd.as_path().to_str().ok_or_else(|| {
                ExecutionError::new(
                    ErrorKind::ExecutionFailed,
                    "Working directory is not valid UTF-8 and cannot be passed to --cd",
                )
            })?;
            args.push("--cd".to_string());
            args.push(cwd.to_string());
        }

        if let Some(model) = &options.model {
            validate_model_param(model)?;
            args.push("--model".to_string());
            args.push(model.clone());
        }

        if options.skip_git_repo_check {
            args.push("--skip-git-repo-check".to_string());
        }

        args.push(STDIN_MARKER.to_string());

        let mut env = BTreeMap::new();
        env.insert("CODEX_NON_INTERACTIVE".to_string(), "1".to_string());

        Ok(ValidatedCommand {
            program: binary_path.to_string(),
            args,
            cwd: options
                .working_directory
                .as_ref()
                .map(|cwd| cwd.as_path().to_path_buf()),
            env,
            stdin: request.prompt().to_string(),
        })
    }

    fn install_hint(&self) -> &'static str {
        "Install the Codex CLI with `npm install -g @openai/codex` and make sure `codex` is on PATH."
    }
}

fn validate_model_param(model: &str) -> Result<(), ExecutionError> {
    let valid = !model.is_empty()
        && model
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(ExecutionError::new(
            ErrorKind::ExecutionFailed,
            format!(
                "Model '{}' contains invalid characters (only alphanumeric, '.', '-' and '_' allowed)",
                model
            ),
        ))
    }
}
