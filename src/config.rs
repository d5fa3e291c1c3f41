use crate::errors::{AppError, AppResult};
use crate::models::DEFAULT_TIMEOUT_MS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const OUTPUT_LIMIT_BYTES: usize = 1_048_576;
pub const KILL_GRACE_MS: u64 = 5_000;
const MIN_CONCURRENCY: usize = 1;
const MAX_CONCURRENCY: usize = 10;
const ENV_PREFIX: &str = "CODEX_BRIDGE_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerSettings {
    pub codex_path: String,
    pub allowed_roots: Vec<PathBuf>,
    pub allow_full_access: bool,
    pub allow_full_auto: bool,
    pub max_concurrency: usize,
    pub default_timeout_ms: u64,
    pub output_limit_bytes: usize,
    pub kill_grace_ms: u64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            codex_path: "codex".to_string(),
            allowed_roots: Vec::new(),
            allow_full_access: false,
            allow_full_auto: false,
            max_concurrency: 3,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            output_limit_bytes: OUTPUT_LIMIT_BYTES,
            kill_grace_ms: KILL_GRACE_MS,
        }
    }
}

impl RunnerSettings {
    /// Reads a YAML or JSON settings file, picked by extension.
    pub fn from_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let settings: Self = if is_json {
            serde_json::from_str(&raw).map_err(|error| AppError::Config(error.to_string()))?
        } else {
            serde_yaml::from_str(&raw)?
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Builds settings from `CODEX_BRIDGE_*` variables on top of the defaults.
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let mut settings = Self::default();
        if let Some(path) = lookup("CODEX_PATH") {
            settings.codex_path = path;
        }
        if let Some(roots) = lookup("ALLOWED_ROOTS") {
            settings.allowed_roots = std::env::split_paths(&roots)
                .filter(|root| !root.as_os_str().is_empty())
                .collect();
        }
        if let Some(value) = lookup("ALLOW_FULL_ACCESS") {
            settings.allow_full_access = parse_flag("ALLOW_FULL_ACCESS", &value)?;
        }
        if let Some(value) = lookup("ALLOW_FULL_AUTO") {
            settings.allow_full_auto = parse_flag("ALLOW_FULL_AUTO", &value)?;
        }
        if let Some(value) = lookup("MAX_CONCURRENCY") {
            settings.max_concurrency = parse_number("MAX_CONCURRENCY", &value)?;
        }
        if let Some(value) = lookup("TIMEOUT_MS") {
            settings.default_timeout_ms = parse_number("TIMEOUT_MS", &value)?;
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.codex_path.trim().is_empty() {
            return Err(AppError::Config("codexPath cannot be empty".to_string()));
        }
        if self.allowed_roots.is_empty() {
            return Err(AppError::Config(
                "At least one allowed working-directory root is required".to_string(),
            ));
        }
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.max_concurrency) {
            return Err(AppError::Config(format!(
                "maxConcurrency {} is out of allowed range ({}..={})",
                self.max_concurrency, MIN_CONCURRENCY, MAX_CONCURRENCY
            )));
        }
        if self.default_timeout_ms == 0 {
            return Err(AppError::Config("defaultTimeoutMs must be greater than zero".to_string()));
        }
        if self.output_limit_bytes == 0 {
            return Err(AppError::Config("outputLimitBytes must be greater than zero".to_string()));
        }
        Ok(())
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

fn parse_flag(key: &str, value: &str) -> AppResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(AppError::Config(format!(
            "{}{} expects a boolean, got '{}'",
            ENV_PREFIX, key, other
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> AppResult<T> {
    value.trim().parse::<T>().map_err(|_| {
        AppError::Config(format!(
            "{}{} expects a number, got '{}'",
            ENV_PREFIX, key, value
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::RunnerSettings;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_defaults() {
        let settings = RunnerSettings::from_lookup(lookup(&[
            ("ALLOWED_ROOTS", "/srv/repos"),
            ("MAX_CONCURRENCY", "5"),
            ("ALLOW_FULL_AUTO", "yes"),
        ]))
        .expect("settings");
        assert_eq!(settings.allowed_roots.len(), 1);
        assert_eq!(settings.max_concurrency, 5);
        assert!(settings.allow_full_auto);
        assert!(!settings.allow_full_access);
        assert_eq!(settings.codex_path, "codex");
    }

    #[test]
    fn rejects_out_of_range_concurrency() {
        let err = RunnerSettings::from_lookup(lookup(&[
            ("ALLOWED_ROOTS", "/srv/repos"),
            ("MAX_CONCURRENCY", "11"),
        ]))
        .expect_err("out of range");
        assert!(err.to_string().contains("maxConcurrency 11"));

        let err = RunnerSettings::from_lookup(lookup(&[
            ("ALLOWED_ROOTS", "/srv/repos"),
            ("MAX_CONCURRENCY", "0"),
        ]))
        .expect_err("zero");
        assert!(err.to_string().contains("out of allowed range"));
    }

    #[test]
    fn requires_allowed_roots() {
        let err = RunnerSettings::from_lookup(lookup(&[])).expect_err("no roots");
        assert!(err.to_string().contains("allowed working-directory root"));
    }

    #[test]
    fn rejects_malformed_flags() {
        let err = RunnerSettings::from_lookup(lookup(&[
            ("ALLOWED_ROOTS", "/srv/repos"),
            ("ALLOW_FULL_ACCESS", "maybe"),
        ]))
        .expect_err("bad flag");
        assert!(err.to_string().contains("expects a boolean"));
    }

    #[test]
    fn loads_yaml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("tempfile");
        writeln!(file, "allowedRoots:\n  - /srv/repos\nmaxConcurrency: 2\ncodexPath: /opt/codex").expect("write");
        let settings = RunnerSettings::from_file(file.path()).expect("settings");
        assert_eq!(settings.max_concurrency, 2);
        assert_eq!(settings.codex_path, "/opt/codex");
        assert_eq!(settings.output_limit_bytes, super::OUTPUT_LIMIT_BYTES);
    }

    #[test]
    fn loads_json_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".json")
            .tempfile()
            .expect("tempfile");
        write!(file, r#"{{"allowedRoots":["/srv/repos"],"allowFullAccess":true}}"#).expect("write");
        let settings = RunnerSettings::from_file(file.path()).expect("settings");
        assert!(settings.allow_full_access);
        assert_eq!(settings.max_concurrency, 3);
    }
}
