//! Credential helper fetcher
//!
//! Obtains tokens by running an external helper command. The helper prints
//! one JSON object on stdout:
//!
//! ```json
//! {"token": "...", "expires_in": 900, "issued_at": 1767225600000}
//! ```
//!
//! `expires_in` is in seconds; `issued_at` (unix milliseconds) is optional
//! and defaults to the time the helper returned. Exit status 77 means the
//! helper's own grant was rejected; every other failure is a transport
//! error. The attempt context is passed through `TOKEN_AGENT_*` env vars.

use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use token_lifecycle::{
    Clock, FetchError, FetchFuture, FetchRequest, Timestamp, TokenFetcher, TokenGrant,
};

use crate::config::FetcherConfig;

/// Helper exit status for a rejected grant (`EX_NOPERM`).
pub const EXIT_UNAUTHORIZED: i32 = 77;

/// Longest stderr excerpt carried into an error message.
const MAX_STDERR_CHARS: usize = 512;

#[derive(Debug, Deserialize)]
struct HelperOutput {
    token: String,
    expires_in: u64,
    #[serde(default)]
    issued_at: Option<Timestamp>,
}

/// [`TokenFetcher`] backed by a helper command.
pub struct CommandFetcher {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl CommandFetcher {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
            clock,
        }
    }

    pub fn from_config(config: &FetcherConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config.command.clone(),
            config.args.clone(),
            config.timeout(),
            clock,
        )
    }

    async fn run(&self, request: &FetchRequest) -> Result<Vec<u8>, FetchError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .env("TOKEN_AGENT_ATTEMPT", request.attempt.to_string())
            .env("TOKEN_AGENT_REASON", request.reason.label())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(expires_at) = request.current_expires_at {
            cmd.env("TOKEN_AGENT_CURRENT_EXPIRES_AT", expires_at.to_string());
        }

        debug!(
            command = %self.command,
            attempt = request.attempt,
            reason = request.reason.label(),
            "running credential helper"
        );

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(FetchError::Transport(format!(
                    "failed to run {}: {e}",
                    self.command
                )));
            }
            Err(_) => {
                return Err(FetchError::Transport(format!(
                    "credential helper timed out after {}s",
                    self.timeout.as_secs_f64()
                )));
            }
        };

        if output.status.success() {
            return Ok(output.stdout);
        }

        let stderr = stderr_excerpt(&output.stderr);
        warn!(status = ?output.status.code(), stderr = %stderr, "credential helper failed");
        Err(match output.status.code() {
            Some(EXIT_UNAUTHORIZED) => FetchError::Unauthorized(if stderr.is_empty() {
                "credential helper rejected the grant".into()
            } else {
                stderr
            }),
            Some(code) => {
                FetchError::Transport(format!("credential helper exited with status {code}: {stderr}"))
            }
            None => FetchError::Transport("credential helper terminated by signal".into()),
        })
    }
}

impl TokenFetcher for CommandFetcher {
    fn fetch(&self, request: FetchRequest) -> FetchFuture<'_> {
        Box::pin(async move {
            let stdout = self.run(&request).await?;
            parse_output(&stdout, self.clock.now())
        })
    }
}

fn parse_output(stdout: &[u8], now: Timestamp) -> Result<TokenGrant, FetchError> {
    let output: HelperOutput = serde_json::from_slice(stdout)
        .map_err(|e| FetchError::Malformed(format!("helper output is not valid JSON: {e}")))?;

    if output.token.is_empty() {
        return Err(FetchError::Malformed("helper returned an empty token".into()));
    }
    if output.expires_in == 0 {
        return Err(FetchError::Malformed("expires_in must be greater than 0".into()));
    }

    Ok(TokenGrant::expiring_in(
        output.token,
        output.issued_at.unwrap_or(now),
        Duration::from_secs(output.expires_in),
    ))
}

fn stderr_excerpt(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .trim()
        .chars()
        .take(MAX_STDERR_CHARS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use token_lifecycle::{ManualClock, RefreshReason};

    fn request() -> FetchRequest {
        FetchRequest {
            attempt: 1,
            reason: RefreshReason::Scheduled,
            current_expires_at: Some(900_000),
        }
    }

    fn shell(script: &str) -> CommandFetcher {
        CommandFetcher::new(
            "sh",
            vec!["-c".into(), script.into()],
            Duration::from_secs(5),
            Arc::new(ManualClock::new(1_000)),
        )
    }

    #[test]
    fn parse_output_stamps_now_without_issued_at() {
        let grant = parse_output(br#"{"token":"tok-1","expires_in":900}"#, 5_000).unwrap();
        assert_eq!(grant.value.expose(), "tok-1");
        assert_eq!(grant.issued_at, Some(5_000));
        assert_eq!(grant.expires_at, 905_000);
    }

    #[test]
    fn parse_output_honours_issued_at() {
        let grant =
            parse_output(br#"{"token":"tok-1","expires_in":60,"issued_at":2000}"#, 5_000).unwrap();
        assert_eq!(grant.issued_at, Some(2_000));
        assert_eq!(grant.expires_at, 62_000);
    }

    #[test]
    fn parse_output_rejects_bad_payloads() {
        for payload in [
            &b"not json"[..],
            &br#"{"expires_in":60}"#[..],
            &br#"{"token":"","expires_in":60}"#[..],
            &br#"{"token":"tok","expires_in":0}"#[..],
        ] {
            let err = parse_output(payload, 0).unwrap_err();
            assert_eq!(err.kind(), "malformed", "payload: {payload:?}");
        }
    }

    #[test]
    fn stderr_excerpt_is_bounded() {
        let long = "x".repeat(2 * MAX_STDERR_CHARS);
        assert_eq!(stderr_excerpt(long.as_bytes()).len(), MAX_STDERR_CHARS);
        assert_eq!(stderr_excerpt(b"  denied\n"), "denied");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fetch_parses_helper_stdout() {
        let fetcher = shell(r#"printf '{"token":"tok-1","expires_in":900}'"#);
        let grant = fetcher.fetch(request()).await.unwrap();
        assert_eq!(grant.value.expose(), "tok-1");
        assert_eq!(grant.expires_at, 901_000);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fetch_passes_attempt_context_in_env() {
        let fetcher = shell(
            r#"printf '{"token":"%s-%s-%s","expires_in":60}' "$TOKEN_AGENT_REASON" "$TOKEN_AGENT_ATTEMPT" "$TOKEN_AGENT_CURRENT_EXPIRES_AT""#,
        );
        let grant = fetcher.fetch(request()).await.unwrap();
        assert_eq!(grant.value.expose(), "scheduled-1-900000");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_77_is_unauthorized() {
        let fetcher = shell("echo 'refresh token revoked' >&2; exit 77");
        let err = fetcher.fetch(request()).await.unwrap_err();
        assert_eq!(err, FetchError::Unauthorized("refresh token revoked".into()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn other_exit_codes_are_transport_errors() {
        let fetcher = shell("echo 'connection refused' >&2; exit 1");
        let err = fetcher.fetch(request()).await.unwrap_err();
        assert_eq!(err.kind(), "transport");
        assert!(err.to_string().contains("status 1"), "got: {err}");
        assert!(err.to_string().contains("connection refused"), "got: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn malformed_stdout_is_reported() {
        let fetcher = shell("echo '<html>502</html>'");
        let err = fetcher.fetch(request()).await.unwrap_err();
        assert_eq!(err.kind(), "malformed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_helper_times_out() {
        let fetcher = CommandFetcher::new(
            "sh",
            vec!["-c".into(), "sleep 5".into()],
            Duration::from_millis(100),
            Arc::new(ManualClock::new(0)),
        );
        let err = fetcher.fetch(request()).await.unwrap_err();
        assert_eq!(err.kind(), "transport");
        assert!(err.to_string().contains("timed out"), "got: {err}");
    }

    #[tokio::test]
    async fn missing_binary_is_a_transport_error() {
        let fetcher = CommandFetcher::new(
            "/nonexistent/token-helper",
            Vec::new(),
            Duration::from_secs(1),
            Arc::new(ManualClock::new(0)),
        );
        let err = fetcher.fetch(request()).await.unwrap_err();
        assert_eq!(err.kind(), "transport");
        assert!(err.to_string().contains("/nonexistent/token-helper"), "got: {err}");
    }
}
