use std::path::PathBuf;

use thiserror::Error;

/// Main error type for takt with structured error handling.
///
/// The variants follow the operational taxonomy: validation problems are
/// never retried, provider failures carry enough context for an actionable
/// hint, and aborts are distinguishable from real failures so the scheduler
/// can record them correctly.
#[derive(Error, Debug)]
pub enum TaktError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse/serialize failed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parse/serialize failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed input: bad YAML shape, bad version string, traversal path,
    /// missing required field. Surfaced with a non-zero exit, never retried.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// A named resource (facet, piece, content file) could not be found.
    #[error("{kind} not found: {name}")]
    ResourceMissing { kind: &'static str, name: String },

    /// Provider subprocess failure, classified for user-facing hints.
    #[error("Provider error ({provider}): {failure}")]
    Provider {
        provider: String,
        failure: ProviderFailure,
    },

    /// A child was cancelled via signal or timed out.
    #[error("Aborted: {reason}")]
    Aborted { reason: String },

    /// Exclusive resource busy, e.g. a sibling clone directory already exists.
    #[error("Concurrency failure: {message}")]
    Concurrency { message: String },

    /// Fetch/clone failure. Non-fatal when the caller has a local fall-back.
    #[error("Network failure: {message}")]
    Network { message: String },
}

/// Classification of a provider subprocess failure.
#[derive(Error, Debug)]
pub enum ProviderFailure {
    /// Authentication rejected. The hint names the env var to set.
    #[error("authentication failed (set {env_var})")]
    Auth { env_var: String },

    /// The provider CLI binary is not installed or not on PATH.
    #[error("binary '{binary}' not found ({install_hint})")]
    BinaryMissing {
        binary: String,
        install_hint: String,
    },

    /// The subprocess exited successfully but produced no output.
    #[error("provider produced no output")]
    EmptyOutput,

    /// A stream exceeded the per-stream buffer cap.
    #[error("provider output exceeded {limit_bytes} bytes")]
    OutputTooLarge { limit_bytes: usize },

    /// Anything else; the message has been passed through secret redaction.
    #[error("{message}")]
    Other { message: String },
}

impl TaktError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn missing(kind: &'static str, name: impl Into<String>) -> Self {
        Self::ResourceMissing {
            kind,
            name: name.into(),
        }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Whether this error came from cancellation rather than a real fault.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

/// Diagnostic for an invalid path-type environment variable.
#[derive(Error, Debug)]
pub enum PathEnvError {
    #[error("{var} must be an absolute path, got '{value}'")]
    NotAbsolute { var: String, value: String },

    #[error("{var} contains control characters")]
    ControlCharacters { var: String },

    #[error("{var} does not point to an existing file: {path}")]
    NotFound { var: String, path: PathBuf },

    #[error("{var} does not point to an executable file: {path}")]
    NotExecutable { var: String, path: PathBuf },
}

impl From<PathEnvError> for TaktError {
    fn from(e: PathEnvError) -> Self {
        TaktError::Validation {
            message: e.to_string(),
        }
    }
}

/// Redact credential-shaped substrings before any stderr reaches the user.
pub fn redact_secrets(input: &str) -> String {
    // Compiled on demand; error output is not a hot path.
    let patterns = [
        r"ghp_[A-Za-z0-9]{10,}",
        r"github_pat_[A-Za-z0-9_]{10,}",
        r"sk-[A-Za-z0-9-]{10,}",
        r"(?i)bearer\s+[A-Za-z0-9._-]{10,}",
    ];
    let mut out = input.to_string();
    for pattern in patterns {
        if let Ok(re) = regex::Regex::new(pattern) {
            out = re.replace_all(&out, "[REDACTED]").into_owned();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_github_token() {
        let input = "fatal: auth failed for ghp_abcdEFGH1234567890xyz on push";
        let redacted = redact_secrets(input);
        assert!(!redacted.contains("ghp_"));
        assert!(redacted.contains("[REDACTED]"));
        assert!(redacted.contains("fatal: auth failed"));
    }

    #[test]
    fn test_redact_api_key() {
        let input = "error: sk-ant-api03-abcdefghijkl rejected";
        let redacted = redact_secrets(input);
        assert!(!redacted.contains("sk-ant"));
    }

    #[test]
    fn test_redact_leaves_plain_text() {
        let input = "git clone failed: repository not found";
        assert_eq!(redact_secrets(input), input);
    }

    #[test]
    fn test_aborted_detection() {
        let err = TaktError::aborted("timeout");
        assert!(err.is_aborted());
        let err = TaktError::validation("bad yaml");
        assert!(!err.is_aborted());
    }

    #[test]
    fn test_provider_failure_messages() {
        let failure = ProviderFailure::Auth {
            env_var: "TAKT_ANTHROPIC_API_KEY".to_string(),
        };
        assert!(failure.to_string().contains("TAKT_ANTHROPIC_API_KEY"));

        let failure = ProviderFailure::BinaryMissing {
            binary: "codex".to_string(),
            install_hint: "npm install -g @openai/codex".to_string(),
        };
        assert!(failure.to_string().contains("codex"));
        assert!(failure.to_string().contains("npm install"));
    }
}
