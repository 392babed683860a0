//! In-process mock provider driven by a JSON scenario file.
//!
//! `TAKT_MOCK_SCENARIO` points at a JSON document mapping movement names to
//! ordered response lists; each invocation of a movement consumes the next
//! entry, and the last entry repeats once the list is exhausted:
//!
//! ```json
//! {
//!   "responses": {
//!     "review": [
//!       {"content": "REV-001: missing test\nSTATUS: fixes_needed"},
//!       {"content": "STATUS: approved"}
//!     ]
//!   },
//!   "default": "STATUS: done"
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;

use super::{AgentInvoker, AgentReply, InvocationRequest};
use crate::error::TaktError;

pub const SCENARIO_ENV_VAR: &str = "TAKT_MOCK_SCENARIO";

#[derive(Debug, Clone, Deserialize)]
struct ScenarioFile {
    #[serde(default)]
    responses: HashMap<String, Vec<ScenarioResponse>>,
    #[serde(default)]
    default: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ScenarioResponse {
    content: String,
    #[serde(default)]
    session_id: Option<String>,
    /// Marks this entry as a simulated provider failure
    #[serde(default)]
    error: Option<String>,
}

/// Scenario-driven invoker. Keeps a per-movement cursor so repeated
/// executions of the same movement walk the scripted sequence.
pub struct MockInvoker {
    scenario: ScenarioFile,
    cursors: Mutex<HashMap<String, usize>>,
}

impl MockInvoker {
    /// Load the scenario named by `TAKT_MOCK_SCENARIO`.
    pub fn from_env() -> Result<Self, TaktError> {
        let path = std::env::var(SCENARIO_ENV_VAR).map_err(|_| {
            TaktError::validation(format!("{SCENARIO_ENV_VAR} is not set for the mock provider"))
        })?;
        Self::from_file(Path::new(&path))
    }

    pub fn from_file(path: &Path) -> Result<Self, TaktError> {
        let contents = std::fs::read_to_string(path)?;
        let scenario: ScenarioFile = serde_json::from_str(&contents)?;
        Ok(Self {
            scenario,
            cursors: Mutex::new(HashMap::new()),
        })
    }

    fn next_response(&self, movement: &str) -> Option<ScenarioResponse> {
        let entries = self.scenario.responses.get(movement)?;
        if entries.is_empty() {
            return None;
        }
        let mut cursors = self.cursors.lock().expect("cursor lock");
        let cursor = cursors.entry(movement.to_string()).or_insert(0);
        let index = (*cursor).min(entries.len() - 1);
        *cursor += 1;
        Some(entries[index].clone())
    }
}

#[async_trait]
impl AgentInvoker for MockInvoker {
    async fn invoke(&self, request: &InvocationRequest) -> Result<AgentReply, TaktError> {
        if request.cancel.is_cancelled() {
            return Err(TaktError::aborted("aborted"));
        }

        if let Some(response) = self.next_response(&request.movement) {
            if let Some(error) = response.error {
                return Err(TaktError::Provider {
                    provider: "mock".to_string(),
                    failure: crate::error::ProviderFailure::Other { message: error },
                });
            }
            return Ok(AgentReply {
                content: response.content,
                session_id: response.session_id,
            });
        }

        if let Some(default) = &self.scenario.default {
            return Ok(AgentReply {
                content: default.clone(),
                session_id: None,
            });
        }

        Err(TaktError::missing("mock scenario entry", request.movement.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::PermissionMode;
    use crate::provider::{ProviderKind, DEFAULT_TIMEOUT};
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;

    fn write_scenario(dir: &tempfile::TempDir, json: &str) -> std::path::PathBuf {
        let path = dir.path().join("scenario.json");
        std::fs::write(&path, json).unwrap();
        path
    }

    fn request_for(movement: &str) -> InvocationRequest {
        InvocationRequest {
            movement: movement.to_string(),
            persona: "tester".to_string(),
            prompt: String::new(),
            provider: ProviderKind::Mock,
            model: None,
            permission_mode: PermissionMode::Readonly,
            allowed_tools: vec![],
            working_dir: PathBuf::from("."),
            session_id: None,
            timeout: DEFAULT_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_sequence_consumed_in_order_then_repeats() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_scenario(
            &dir,
            r#"{"responses": {"review": [{"content": "first"}, {"content": "second"}]}}"#,
        );
        let invoker = MockInvoker::from_file(&path).unwrap();
        let req = request_for("review");

        assert_eq!(invoker.invoke(&req).await.unwrap().content, "first");
        assert_eq!(invoker.invoke(&req).await.unwrap().content, "second");
        // Exhausted list repeats its last entry
        assert_eq!(invoker.invoke(&req).await.unwrap().content, "second");
    }

    #[tokio::test]
    async fn test_default_fallback() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_scenario(&dir, r#"{"default": "STATUS: done"}"#);
        let invoker = MockInvoker::from_file(&path).unwrap();
        let reply = invoker.invoke(&request_for("anything")).await.unwrap();
        assert_eq!(reply.content, "STATUS: done");
    }

    #[tokio::test]
    async fn test_missing_entry_without_default_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_scenario(&dir, r#"{"responses": {}}"#);
        let invoker = MockInvoker::from_file(&path).unwrap();
        let err = invoker.invoke(&request_for("ghost")).await.unwrap_err();
        assert!(matches!(err, TaktError::ResourceMissing { .. }));
    }

    #[tokio::test]
    async fn test_scripted_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_scenario(
            &dir,
            r#"{"responses": {"implement": [{"content": "", "error": "simulated crash"}]}}"#,
        );
        let invoker = MockInvoker::from_file(&path).unwrap();
        let err = invoker.invoke(&request_for("implement")).await.unwrap_err();
        assert!(matches!(err, TaktError::Provider { .. }));
    }
}
