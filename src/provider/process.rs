//! Provider subprocess supervision.
//!
//! Each provider invocation is a direct child process: stdout and stderr are
//! drained into bounded buffers, the invocation is raced against its timeout
//! and the abort signal, and failures are classified into the provider error
//! taxonomy before they reach the user.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::InvocationRequest;
use crate::error::{redact_secrets, ProviderFailure, TaktError};

/// Per-stream buffer cap. Exceeding it aborts the invocation.
pub const MAX_STREAM_BYTES: usize = 10 * 1024 * 1024;

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

enum WaitOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
    Overflowed,
}

/// Run one provider subprocess to completion and return its stdout.
pub async fn run_provider(
    request: &InvocationRequest,
    binary: &Path,
    args: &[String],
    token: Option<&SecretString>,
) -> Result<String, TaktError> {
    let mut command = Command::new(binary);
    command
        .args(args)
        .current_dir(&request.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let (Some(var), Some(token)) = (request.provider.child_token_env_var(), token) {
        command.env(var, token.expose_secret());
    }

    debug!(
        "Spawning provider '{}' for movement '{}'",
        request.provider.name(),
        request.movement
    );

    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            provider_error(
                request,
                ProviderFailure::BinaryMissing {
                    binary: binary.display().to_string(),
                    install_hint: request.provider.install_hint().to_string(),
                },
            )
        } else {
            TaktError::Io(e)
        }
    })?;

    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");

    // Readers cancel this token the moment a stream exceeds the cap, so the
    // child can be torn down without waiting for the timeout.
    let overflow = CancellationToken::new();
    let stdout_overflow = overflow.clone();
    let stderr_overflow = overflow.clone();
    let stdout_task =
        tokio::spawn(async move { read_capped(&mut stdout, &stdout_overflow).await });
    let stderr_task =
        tokio::spawn(async move { read_capped(&mut stderr, &stderr_overflow).await });

    let outcome = tokio::select! {
        status = child.wait() => WaitOutcome::Exited(status),
        _ = request.cancel.cancelled() => WaitOutcome::Cancelled,
        _ = overflow.cancelled() => WaitOutcome::Overflowed,
        _ = tokio::time::sleep(request.timeout) => WaitOutcome::TimedOut,
    };

    let status = match outcome {
        WaitOutcome::Cancelled => {
            terminate(&mut child).await;
            return Err(TaktError::aborted("aborted"));
        }
        WaitOutcome::TimedOut => {
            terminate(&mut child).await;
            return Err(TaktError::aborted(format!(
                "provider timed out after {}s",
                request.timeout.as_secs()
            )));
        }
        WaitOutcome::Overflowed => {
            terminate(&mut child).await;
            return Err(provider_error(
                request,
                ProviderFailure::OutputTooLarge {
                    limit_bytes: MAX_STREAM_BYTES,
                },
            ));
        }
        WaitOutcome::Exited(status) => status.map_err(TaktError::Io)?,
    };

    let stdout_bytes = stdout_task.await.unwrap_or_default();
    let stderr_bytes = stderr_task.await.unwrap_or_default();
    if overflow.is_cancelled() {
        return Err(provider_error(
            request,
            ProviderFailure::OutputTooLarge {
                limit_bytes: MAX_STREAM_BYTES,
            },
        ));
    }

    let stderr_text = String::from_utf8_lossy(&stderr_bytes).into_owned();

    if !status.success() {
        warn!(
            "Provider '{}' exited with {:?}",
            request.provider.name(),
            status.code()
        );
        return Err(provider_error(
            request,
            classify_failure(request, &stderr_text),
        ));
    }

    let content = String::from_utf8_lossy(&stdout_bytes).into_owned();
    if content.trim().is_empty() {
        return Err(provider_error(request, ProviderFailure::EmptyOutput));
    }

    Ok(content)
}

/// Read a stream into a buffer. On exceeding the cap, cancel the overflow
/// token and stop reading.
async fn read_capped<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    overflow: &CancellationToken,
) -> Vec<u8> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => return buffer,
            Ok(n) => {
                if buffer.len() + n > MAX_STREAM_BYTES {
                    overflow.cancel();
                    return buffer;
                }
                buffer.extend_from_slice(&chunk[..n]);
            }
            Err(_) => return buffer,
        }
    }
}

/// Classify a non-zero exit from its stderr signature.
pub fn classify_failure(request: &InvocationRequest, stderr: &str) -> ProviderFailure {
    let lower = stderr.to_lowercase();

    if lower.contains("command not found") || lower.contains("no such file") {
        return ProviderFailure::BinaryMissing {
            binary: request.provider.binary().to_string(),
            install_hint: request.provider.install_hint().to_string(),
        };
    }

    let auth_markers = [
        "unauthorized",
        "401",
        "invalid api key",
        "authentication",
        "not logged in",
        "credit balance",
    ];
    if auth_markers.iter().any(|m| lower.contains(m)) {
        return ProviderFailure::Auth {
            env_var: request
                .provider
                .token_env_var()
                .unwrap_or("the provider token")
                .to_string(),
        };
    }

    ProviderFailure::Other {
        message: redact_secrets(stderr.trim()),
    }
}

fn provider_error(request: &InvocationRequest, failure: ProviderFailure) -> TaktError {
    TaktError::Provider {
        provider: request.provider.name().to_string(),
        failure,
    }
}

/// SIGTERM, grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            let exited = tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok();
            if exited {
                return;
            }
        }
    }
    let _ = child.kill().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::PermissionMode;
    use crate::provider::{ProviderKind, DEFAULT_TIMEOUT};
    use std::path::PathBuf;

    fn request(provider: ProviderKind) -> InvocationRequest {
        InvocationRequest {
            movement: "m".to_string(),
            persona: "p".to_string(),
            prompt: "hello".to_string(),
            provider,
            model: None,
            permission_mode: PermissionMode::Edit,
            allowed_tools: vec![],
            working_dir: PathBuf::from("."),
            session_id: None,
            timeout: DEFAULT_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_classify_auth_failure() {
        let req = request(ProviderKind::Claude);
        let failure = classify_failure(&req, "Error: 401 Unauthorized");
        assert!(
            matches!(failure, ProviderFailure::Auth { ref env_var } if env_var == "TAKT_ANTHROPIC_API_KEY")
        );
    }

    #[test]
    fn test_classify_missing_binary() {
        let req = request(ProviderKind::Codex);
        let failure = classify_failure(&req, "sh: codex: command not found");
        assert!(matches!(failure, ProviderFailure::BinaryMissing { .. }));
    }

    #[test]
    fn test_classify_other_redacts_secrets() {
        let req = request(ProviderKind::Claude);
        let failure = classify_failure(&req, "push rejected for ghp_1234567890abcdef1234");
        match failure {
            ProviderFailure::Other { message } => {
                assert!(!message.contains("ghp_"));
                assert!(message.contains("[REDACTED]"));
            }
            other => panic!("expected Other, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_spawn() {
        let req = request(ProviderKind::Mock);
        let result = run_provider(
            &req,
            Path::new("/nonexistent/takt-test-binary"),
            &["x".to_string()],
            None,
        )
        .await;
        match result {
            Err(TaktError::Provider { failure, .. }) => {
                assert!(matches!(failure, ProviderFailure::BinaryMissing { .. }));
            }
            other => panic!("expected BinaryMissing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_aborts_subprocess() {
        let mut req = request(ProviderKind::Mock);
        let cancel = CancellationToken::new();
        req.cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            run_provider(&req, Path::new("/bin/sleep"), &["30".to_string()], None).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(TaktError::Aborted { .. })));
    }

    #[tokio::test]
    async fn test_empty_output_detected() {
        let req = request(ProviderKind::Mock);
        // `true` exits 0 with no output at all
        let result = run_provider(&req, Path::new("/bin/true"), &[], None).await;
        match result {
            Err(TaktError::Provider { failure, .. }) => {
                assert!(matches!(failure, ProviderFailure::EmptyOutput));
            }
            other => panic!("expected EmptyOutput, got {other:?}"),
        }
    }
}
