use crate::models::{ErrorKind, ExecutionError};

// Keyword matching is best effort: reworded or localized CLI output falls
// through to the generic ExecutionFailed.
static AUTH_PATTERNS: &[&str] = &[
    "authentication",
    "unauthorized",
    "not logged in",
    "invalid api key",
    "incorrect api key",
    "401",
];

static PERMISSION_PATTERNS: &[&str] = &[
    "permission denied",
    "operation not permitted",
    "eacces",
    "access is denied",
];

static MISSING_PATTERNS: &[&str] = &[
    "command not found",
    "no such file or directory",
    "not installed",
    "enoent",
    "is not recognized as an internal or external command",
];

pub const MAX_DETAILS_CHARS: usize = 8_000;

fn contains_any(lower: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|pattern| lower.contains(pattern))
}

/// Classifies a non-zero exit from its combined stderr/stdout text.
///
/// `details` carries the whole trimmed output. It is only cut down to
/// [`MAX_DETAILS_CHARS`] after redaction, so a secret straddling the cut
/// still has its key or prefix in view when the rules run.
pub fn classify_exit(exit_code: Option<i32>, output: &str, install_hint: &str) -> ExecutionError {
    let lower = output.to_ascii_lowercase();
    let code = exit_code
        .map(|code| code.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let error = if contains_any(&lower, AUTH_PATTERNS) {
        ExecutionError::new(
            ErrorKind::AuthenticationFailed,
            "Codex authentication failed. Run `codex login` or set OPENAI_API_KEY.",
        )
    } else if contains_any(&lower, PERMISSION_PATTERNS) {
        ExecutionError::new(
            ErrorKind::PermissionDenied,
            format!("Codex was denied permission (exit code {})", code),
        )
    } else if contains_any(&lower, MISSING_PATTERNS) {
        ExecutionError::new(
            ErrorKind::NotFound,
            format!("Codex reported a missing file or command (exit code {}). {}", code, install_hint),
        )
    } else {
        ExecutionError::new(
            ErrorKind::ExecutionFailed,
            format!("Codex exited with code {}", code),
        )
    };

    error.with_details(output.trim())
}

/// Keeps the last `max` characters, where CLI errors usually end up.
pub fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    text.chars().skip(count - max).collect()
}

#[cfg(test)]
mod tests {
    use super::{classify_exit, tail_chars, MAX_DETAILS_CHARS};
    use crate::models::ErrorKind;

    #[test]
    fn detects_failure_variants() {
        let cases = [
            ("Error: 401 Unauthorized", ErrorKind::AuthenticationFailed),
            ("open /repo/.git: Permission denied", ErrorKind::PermissionDenied),
            ("sh: git: command not found", ErrorKind::NotFound),
            ("thread 'main' panicked", ErrorKind::ExecutionFailed),
        ];
        for (text, kind) in cases {
            assert_eq!(classify_exit(Some(1), text, "hint").kind, kind, "{text}");
        }
    }

    #[test]
    fn attaches_raw_output_as_details() {
        let error = classify_exit(Some(2), "  boom\n", "hint");
        assert_eq!(error.message, "Codex exited with code 2");
        assert_eq!(error.details.as_deref(), Some("boom"));

        let silent = classify_exit(None, "", "hint");
        assert!(silent.details.is_none());
        assert!(silent.message.contains("unknown"));
    }

    #[test]
    fn details_are_not_cut_before_redaction() {
        let output = format!("token=abc {}", "y".repeat(MAX_DETAILS_CHARS));
        let error = classify_exit(Some(1), &output, "hint");
        assert!(error.details.expect("details").starts_with("token=abc"));
    }

    #[test]
    fn tail_keeps_the_end_of_long_output() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("äöü", 5), "äöü");
    }
}
