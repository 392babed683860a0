//! Configuration resolution for takt.
//!
//! Two YAML layers are merged: the user config at `USER_HOME/.takt/config.yaml`
//! (overridable via `TAKT_CONFIG_DIR`) and the project overlay at
//! `PROJECT/.takt/config.yaml`. Project values win per scalar field. Secrets
//! resolve env-first with a `secrets:` config fallback and are held as
//! `SecretString` so they never land in logs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PathEnvError, TaktError};

/// Name of the per-directory config file in both layers.
pub const CONFIG_FILE: &str = "config.yaml";

/// Raw on-disk shape shared by the user and project layers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Default piece name used when a task does not specify one
    #[serde(default)]
    pub default_piece: Option<String>,

    /// Default provider for movements that do not override it
    #[serde(default)]
    pub provider: Option<String>,

    /// Default model, paired with `provider` above
    #[serde(default)]
    pub model: Option<String>,

    /// Number of queue tasks executed concurrently
    #[serde(default)]
    pub concurrency: Option<usize>,

    /// Whether clones sync to origin's tip before running
    #[serde(default)]
    pub auto_fetch: Option<bool>,

    /// Permission mode: "default" or "sacrifice-my-pc"
    #[serde(default)]
    pub permission_mode: Option<String>,

    /// Analytics retention window in days
    #[serde(default)]
    pub retention_days: Option<u32>,

    /// Language hint injected into the execution context block
    #[serde(default)]
    pub language: Option<String>,

    /// Quality gates appended to review movements
    #[serde(default)]
    pub quality_gates: Option<Vec<String>>,

    /// Whether the health monitor runs the secondary alignment check
    #[serde(default)]
    pub alignment_check: Option<bool>,

    /// Fallback values for provider tokens (env vars take precedence)
    #[serde(default)]
    pub secrets: Option<HashMap<String, String>>,
}

/// Fully resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub struct TaktConfig {
    pub project_root: PathBuf,
    pub default_piece: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Provider/model as set by the project layer alone (for resolution)
    pub project_provider: Option<String>,
    pub project_model: Option<String>,
    /// Provider/model as set by the user layer alone (for resolution)
    pub global_provider: Option<String>,
    pub global_model: Option<String>,
    pub concurrency: usize,
    pub auto_fetch: bool,
    pub permission_mode: String,
    pub retention_days: u32,
    pub language: String,
    pub quality_gates: Vec<String>,
    pub alignment_check: bool,
    secrets: HashMap<String, String>,
}

impl TaktConfig {
    /// Resolve the user-level takt directory, honoring `TAKT_CONFIG_DIR`.
    pub fn user_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("TAKT_CONFIG_DIR") {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".takt")
    }

    /// Project-level takt directory.
    pub fn project_dir(project_root: &Path) -> PathBuf {
        project_root.join(".takt")
    }

    /// Whether interactive prompts are disabled.
    pub fn no_tty() -> bool {
        std::env::var("TAKT_NO_TTY").map(|v| v == "1").unwrap_or(false)
    }

    /// Load and merge both config layers for a project.
    pub fn load(project_root: &Path) -> Result<Self> {
        let user = read_config_file(&Self::user_dir().join(CONFIG_FILE))?;
        let project = read_config_file(&Self::project_dir(project_root).join(CONFIG_FILE))?;
        Ok(Self::merge(project_root, user, project))
    }

    /// Merge the two layers; project wins per scalar field, quality gates are
    /// additive (user then project, deduplicated).
    pub fn merge(project_root: &Path, user: ConfigFile, project: ConfigFile) -> Self {
        let quality_gates = merge_quality_gates(&user.quality_gates, &project.quality_gates);

        let mut secrets = user.secrets.clone().unwrap_or_default();
        if let Some(project_secrets) = &project.secrets {
            for (k, v) in project_secrets {
                secrets.insert(k.clone(), v.clone());
            }
        }

        Self {
            project_root: project_root.to_path_buf(),
            default_piece: project
                .default_piece
                .clone()
                .or(user.default_piece.clone())
                .unwrap_or_else(|| "default".to_string()),
            provider: project.provider.clone().or(user.provider.clone()),
            model: project.model.clone().or(user.model.clone()),
            project_provider: project.provider.clone(),
            project_model: project.model.clone(),
            global_provider: user.provider.clone(),
            global_model: user.model.clone(),
            concurrency: project.concurrency.or(user.concurrency).unwrap_or(1).max(1),
            auto_fetch: project.auto_fetch.or(user.auto_fetch).unwrap_or(true),
            permission_mode: project
                .permission_mode
                .or(user.permission_mode)
                .unwrap_or_else(|| "default".to_string()),
            retention_days: project.retention_days.or(user.retention_days).unwrap_or(90),
            language: project
                .language
                .or(user.language)
                .unwrap_or_else(|| "en".to_string()),
            quality_gates,
            alignment_check: project
                .alignment_check
                .or(user.alignment_check)
                .unwrap_or(false),
            secrets,
        }
    }

    /// Resolve a secret: environment first, config `secrets:` fallback.
    pub fn resolve_secret(&self, env_var: &str) -> Option<SecretString> {
        if let Ok(value) = std::env::var(env_var) {
            if !value.is_empty() {
                return Some(SecretString::from(value));
            }
        }
        self.secrets
            .get(env_var)
            .map(|v| SecretString::from(v.clone()))
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let parsed: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    debug!("Loaded config from {}", path.display());
    Ok(parsed)
}

/// Additive merge of the quality-gate lists. When both layers explicitly set
/// an empty list the result stays empty; an unset layer contributes nothing.
fn merge_quality_gates(
    user: &Option<Vec<String>>,
    project: &Option<Vec<String>>,
) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for layer in [user, project].into_iter().flatten() {
        for gate in layer {
            if !merged.contains(gate) {
                merged.push(gate.clone());
            }
        }
    }
    merged
}

/// Validate a path-type environment variable: absolute, free of control
/// characters, pointing at an existing executable file. Each violation is a
/// distinct diagnostic and fails fast.
pub fn validate_path_env(var: &str) -> Result<Option<PathBuf>, TaktError> {
    let value = match std::env::var(var) {
        Ok(v) if !v.is_empty() => v,
        _ => return Ok(None),
    };

    if value.chars().any(|c| c.is_control()) {
        return Err(PathEnvError::ControlCharacters {
            var: var.to_string(),
        }
        .into());
    }

    let path = PathBuf::from(&value);
    if !path.is_absolute() {
        return Err(PathEnvError::NotAbsolute {
            var: var.to_string(),
            value,
        }
        .into());
    }
    if !path.is_file() {
        return Err(PathEnvError::NotFound {
            var: var.to_string(),
            path,
        }
        .into());
    }
    if !is_executable(&path) {
        return Err(PathEnvError::NotExecutable {
            var: var.to_string(),
            path,
        }
        .into());
    }

    Ok(Some(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn file_with(provider: Option<&str>, model: Option<&str>) -> ConfigFile {
        ConfigFile {
            provider: provider.map(String::from),
            model: model.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_project_wins() {
        let user = ConfigFile {
            default_piece: Some("review-fix".to_string()),
            concurrency: Some(4),
            ..Default::default()
        };
        let project = ConfigFile {
            default_piece: Some("default".to_string()),
            ..Default::default()
        };
        let merged = TaktConfig::merge(Path::new("/tmp/p"), user, project);
        assert_eq!(merged.default_piece, "default");
        // Unset in project falls through to user
        assert_eq!(merged.concurrency, 4);
    }

    #[test]
    fn test_merge_defaults() {
        let merged = TaktConfig::merge(
            Path::new("/tmp/p"),
            ConfigFile::default(),
            ConfigFile::default(),
        );
        assert_eq!(merged.default_piece, "default");
        assert_eq!(merged.concurrency, 1);
        assert!(merged.auto_fetch);
        assert_eq!(merged.retention_days, 90);
        assert_eq!(merged.language, "en");
        assert!(merged.quality_gates.is_empty());
    }

    #[test]
    fn test_merge_keeps_layer_provider_for_resolution() {
        let user = file_with(Some("claude"), Some("opus"));
        let project = file_with(Some("codex"), None);
        let merged = TaktConfig::merge(Path::new("/tmp/p"), user, project);
        assert_eq!(merged.project_provider.as_deref(), Some("codex"));
        assert_eq!(merged.global_provider.as_deref(), Some("claude"));
        assert_eq!(merged.global_model.as_deref(), Some("opus"));
        assert_eq!(merged.project_model, None);
    }

    #[test]
    fn test_quality_gates_additive_dedup() {
        let user = ConfigFile {
            quality_gates: Some(vec!["lint".to_string(), "tests".to_string()]),
            ..Default::default()
        };
        let project = ConfigFile {
            quality_gates: Some(vec!["tests".to_string(), "security".to_string()]),
            ..Default::default()
        };
        let merged = TaktConfig::merge(Path::new("/tmp/p"), user, project);
        assert_eq!(merged.quality_gates, vec!["lint", "tests", "security"]);
    }

    #[test]
    fn test_quality_gates_both_empty_stays_empty() {
        let user = ConfigFile {
            quality_gates: Some(vec![]),
            ..Default::default()
        };
        let project = ConfigFile {
            quality_gates: Some(vec![]),
            ..Default::default()
        };
        let merged = TaktConfig::merge(Path::new("/tmp/p"), user, project);
        assert!(merged.quality_gates.is_empty());
    }

    #[test]
    fn test_secret_config_fallback() {
        let user = ConfigFile {
            secrets: Some(HashMap::from([(
                "TAKT_TEST_ONLY_TOKEN".to_string(),
                "from-config".to_string(),
            )])),
            ..Default::default()
        };
        let merged = TaktConfig::merge(Path::new("/tmp/p"), user, ConfigFile::default());
        let secret = merged.resolve_secret("TAKT_TEST_ONLY_TOKEN").unwrap();
        assert_eq!(secret.expose_secret(), "from-config");
        assert!(merged.resolve_secret("TAKT_UNSET_TOKEN").is_none());
    }
}
