use crate::config::RunnerSettings;
use crate::errors::{AppError, AppResult};
use crate::models::{CanonicalPath, ExecutionOptions, SandboxMode};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathValidation {
    Valid { canonical_path: CanonicalPath },
    Invalid { reason: String },
}

impl PathValidation {
    fn invalid(reason: &str) -> Self {
        Self::Invalid {
            reason: reason.to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

/// Confines caller-supplied working directories to a set of allowed roots.
///
/// Nothing is cached: every call re-reads the filesystem, since a directory or
/// symlink can change between two requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathGuard;

impl PathGuard {
    pub fn validate(input: &str, allowed_roots: &[PathBuf]) -> PathValidation {
        if input.trim().is_empty() {
            return PathValidation::invalid("empty path");
        }

        let candidate = Path::new(input);
        let absolute = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            match std::env::current_dir() {
                Ok(cwd) => cwd.join(candidate),
                Err(_) => return PathValidation::invalid("cannot resolve real path"),
            }
        };
        let resolved = normalize_lexically(&absolute);

        if !resolved.exists() {
            return PathValidation::invalid("does not exist");
        }

        // Checking `resolved` alone would let a symlink inside a root point
        // anywhere on the filesystem.
        let real = match std::fs::canonicalize(&resolved) {
            Ok(real) => real,
            Err(_) => return PathValidation::invalid("cannot resolve real path"),
        };

        // Component-wise `starts_with` gives the separator boundary:
        // `/home/user` does not contain `/home/username`.
        let allowed = allowed_roots
            .iter()
            .map(|root| canonical_root(root))
            .any(|root| real == root || real.starts_with(&root));
        if !allowed {
            return PathValidation::invalid("outside allowed roots");
        }

        PathValidation::Valid {
            canonical_path: CanonicalPath::new(real),
        }
    }
}

fn canonical_root(root: &Path) -> PathBuf {
    std::fs::canonicalize(root).unwrap_or_else(|_| normalize_lexically(root))
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    normalized
}

/// Applies the configured privilege switches to a request before launch.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    allowed_roots: Vec<PathBuf>,
    allow_full_access: bool,
    allow_full_auto: bool,
}

impl PolicyEngine {
    pub fn new(settings: &RunnerSettings) -> Self {
        Self {
            allowed_roots: settings.allowed_roots.clone(),
            allow_full_access: settings.allow_full_access,
            allow_full_auto: settings.allow_full_auto,
        }
    }

    pub fn resolve_working_directory(&self, requested: &str) -> AppResult<CanonicalPath> {
        match PathGuard::validate(requested, &self.allowed_roots) {
            PathValidation::Valid { canonical_path } => Ok(canonical_path),
            PathValidation::Invalid { reason } => {
                tracing::warn!(reason = %reason, "working directory rejected");
                Err(AppError::Policy(format!("Working directory rejected: {}", reason)))
            }
        }
    }

    pub fn validate_options(&self, options: &ExecutionOptions) -> AppResult<()> {
        if options.sandbox == Some(SandboxMode::DangerFullAccess) && !self.allow_full_access {
            return Err(AppError::Policy(
                "danger-full-access sandbox is disabled by configuration".to_string(),
            ));
        }
        if options.full_auto && !self.allow_full_auto {
            return Err(AppError::Policy(
                "full-auto mode is disabled by configuration".to_string(),
            ));
        }
        if options.timeout_ms == 0 {
            return Err(AppError::Policy("Timeout must be greater than zero".to_string()));
        }
        if let Some(cwd) = &options.working_directory {
            // A CanonicalPath may have been checked against other roots.
            let Some(path) = cwd.as_path().to_str() else {
                return Err(AppError::Policy(
                    "Working directory is not valid UTF-8".to_string(),
                ));
            };
            if let PathValidation::Invalid { reason } = PathGuard::validate(path, &self.allowed_roots) {
                return Err(AppError::Policy(format!("Working directory rejected: {}", reason)));
            }
        }
        Ok(())
    }
}
