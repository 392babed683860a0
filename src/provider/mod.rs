//! Provider registry and the agent-invoker seam.
//!
//! Every provider is an external CLI binary that takes a prompt and writes a
//! response to stdout. The registry maps provider names to binary names,
//! token environment variables, and install hints; the [`AgentInvoker`] trait
//! is the seam between the movement engine and the actual subprocess (or the
//! in-process mock used by tests).

pub mod mock;
pub mod process;
pub mod resolve;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use crate::error::TaktError;
use crate::piece::PermissionMode;

/// Default per-subprocess timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// Known providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Claude,
    Codex,
    Opencode,
    Copilot,
    Cursor,
    Mock,
}

impl ProviderKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            "opencode" => Some(Self::Opencode),
            "copilot" => Some(Self::Copilot),
            "cursor" => Some(Self::Cursor),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Opencode => "opencode",
            Self::Copilot => "copilot",
            Self::Cursor => "cursor",
            Self::Mock => "mock",
        }
    }

    /// The CLI binary shelled out to.
    pub fn binary(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Opencode => "opencode",
            Self::Copilot => "copilot",
            Self::Cursor => "cursor-agent",
            Self::Mock => "mock",
        }
    }

    /// The takt-side env var holding this provider's token.
    pub fn token_env_var(&self) -> Option<&'static str> {
        match self {
            Self::Claude => Some("TAKT_ANTHROPIC_API_KEY"),
            Self::Codex => Some("TAKT_OPENAI_API_KEY"),
            Self::Opencode => Some("TAKT_OPENCODE_API_KEY"),
            Self::Copilot => Some("TAKT_COPILOT_GITHUB_TOKEN"),
            Self::Cursor => Some("TAKT_CURSOR_API_KEY"),
            Self::Mock => None,
        }
    }

    /// The env var name the provider CLI itself reads.
    pub fn child_token_env_var(&self) -> Option<&'static str> {
        match self {
            Self::Claude => Some("ANTHROPIC_API_KEY"),
            Self::Codex => Some("OPENAI_API_KEY"),
            Self::Opencode => Some("OPENCODE_API_KEY"),
            Self::Copilot => Some("GITHUB_TOKEN"),
            Self::Cursor => Some("CURSOR_API_KEY"),
            Self::Mock => None,
        }
    }

    /// Installation hint used by `BinaryMissing` diagnostics.
    pub fn install_hint(&self) -> &'static str {
        match self {
            Self::Claude => "npm install -g @anthropic-ai/claude-code",
            Self::Codex => "npm install -g @openai/codex",
            Self::Opencode => "npm install -g opencode-ai",
            Self::Copilot => "npm install -g @github/copilot",
            Self::Cursor => "curl https://cursor.com/install -fsS | bash",
            Self::Mock => "set TAKT_MOCK_SCENARIO to a scenario file",
        }
    }

    /// Env var overriding the binary path (validated as an absolute
    /// executable path).
    pub fn path_env_var(&self) -> Option<&'static str> {
        match self {
            Self::Codex => Some("TAKT_CODEX_CLI_PATH"),
            _ => None,
        }
    }
}

/// One agent invocation request as seen by an invoker.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    /// Movement name, used by the mock provider to select a scenario entry
    pub movement: String,
    pub persona: String,
    pub prompt: String,
    pub provider: ProviderKind,
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    pub allowed_tools: Vec<String>,
    pub working_dir: PathBuf,
    /// Provider session to resume, when the persona has one
    pub session_id: Option<String>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

/// Raw reply from a provider before outcome detection.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub content: String,
    pub session_id: Option<String>,
}

/// The seam between the movement engine and provider subprocesses.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: &InvocationRequest) -> Result<AgentReply, TaktError>;
}

/// Subprocess-backed invoker for the real provider CLIs.
pub struct CliInvoker {
    tokens: HashMap<ProviderKind, SecretString>,
    binary_overrides: HashMap<ProviderKind, PathBuf>,
}

impl CliInvoker {
    pub fn new(
        tokens: HashMap<ProviderKind, SecretString>,
        binary_overrides: HashMap<ProviderKind, PathBuf>,
    ) -> Self {
        Self {
            tokens,
            binary_overrides,
        }
    }

    /// Build the command line for one provider invocation.
    fn build_args(request: &InvocationRequest) -> Vec<String> {
        match request.provider {
            ProviderKind::Claude => {
                let mut args = vec![
                    "-p".to_string(),
                    request.prompt.clone(),
                    "--output-format".to_string(),
                    "text".to_string(),
                ];
                if let Some(model) = &request.model {
                    args.push("--model".to_string());
                    args.push(model.clone());
                }
                if let Some(session) = &request.session_id {
                    args.push("--resume".to_string());
                    args.push(session.clone());
                }
                if request.permission_mode == PermissionMode::Readonly {
                    args.push("--permission-mode".to_string());
                    args.push("plan".to_string());
                }
                if !request.allowed_tools.is_empty() {
                    args.push("--allowed-tools".to_string());
                    args.push(request.allowed_tools.join(","));
                }
                args
            }
            ProviderKind::Codex => {
                let mut args = vec!["exec".to_string()];
                if let Some(model) = &request.model {
                    args.push("--model".to_string());
                    args.push(model.clone());
                }
                if request.permission_mode != PermissionMode::Readonly {
                    args.push("--full-auto".to_string());
                }
                args.push(request.prompt.clone());
                args
            }
            ProviderKind::Opencode | ProviderKind::Copilot | ProviderKind::Cursor => {
                let mut args = vec!["run".to_string()];
                if let Some(model) = &request.model {
                    args.push("--model".to_string());
                    args.push(model.clone());
                }
                args.push(request.prompt.clone());
                args
            }
            ProviderKind::Mock => vec![request.prompt.clone()],
        }
    }
}

#[async_trait]
impl AgentInvoker for CliInvoker {
    async fn invoke(&self, request: &InvocationRequest) -> Result<AgentReply, TaktError> {
        let binary = self
            .binary_overrides
            .get(&request.provider)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(request.provider.binary()));
        let args = Self::build_args(request);
        let content =
            process::run_provider(request, &binary, &args, self.tokens.get(&request.provider))
                .await?;
        Ok(AgentReply {
            content,
            session_id: request.session_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parse_roundtrip() {
        for kind in [
            ProviderKind::Claude,
            ProviderKind::Codex,
            ProviderKind::Opencode,
            ProviderKind::Copilot,
            ProviderKind::Cursor,
            ProviderKind::Mock,
        ] {
            assert_eq!(ProviderKind::parse(kind.name()), Some(kind));
        }
        assert_eq!(ProviderKind::parse("gpt"), None);
    }

    #[test]
    fn test_token_env_vars() {
        assert_eq!(
            ProviderKind::Claude.token_env_var(),
            Some("TAKT_ANTHROPIC_API_KEY")
        );
        assert_eq!(
            ProviderKind::Codex.token_env_var(),
            Some("TAKT_OPENAI_API_KEY")
        );
        assert_eq!(ProviderKind::Mock.token_env_var(), None);
    }

    #[test]
    fn test_claude_args_include_resume_and_readonly() {
        let request = InvocationRequest {
            movement: "review".to_string(),
            persona: "reviewer".to_string(),
            prompt: "look at this".to_string(),
            provider: ProviderKind::Claude,
            model: Some("opus".to_string()),
            permission_mode: PermissionMode::Readonly,
            allowed_tools: vec![],
            working_dir: PathBuf::from("."),
            session_id: Some("sess-1".to_string()),
            timeout: DEFAULT_TIMEOUT,
            cancel: CancellationToken::new(),
        };
        let args = CliInvoker::build_args(&request);
        assert!(args.contains(&"--resume".to_string()));
        assert!(args.contains(&"sess-1".to_string()));
        assert!(args.contains(&"--permission-mode".to_string()));
        assert!(args.contains(&"opus".to_string()));
    }
}
