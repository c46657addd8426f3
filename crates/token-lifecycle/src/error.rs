//! Error types for credential lifecycle operations
//!
//! Errors are `Clone` because one failed fetch is fanned out to every waiter
//! of a manual refresh and to the manager's event channel.

use crate::fetcher::FetchError;

/// Errors surfaced by the store, scheduler and binder.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("token fetch failed: {0}")]
    FetchFailed(#[from] FetchError),

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("credential expires in {remaining_ms}ms and refresh keeps failing: {last}")]
    ExpiryImminent { last: Box<Error>, remaining_ms: u64 },

    #[error("applying credential to binding {binding} failed: {message}")]
    BindingApplicationFailed { binding: u64, message: String },

    #[error("invalid refresh policy: {0}")]
    InvalidPolicy(String),

    #[error("credential manager not started")]
    NotStarted,

    #[error("credential manager already started")]
    AlreadyStarted,

    #[error("credential manager stopped")]
    Stopped,
}

impl Error {
    /// Short label for metrics and structured logs.
    ///
    /// Fetch failures report the fetcher's own kind so escalations keep the
    /// original cause visible.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::FetchFailed(e) => e.kind(),
            Error::InvalidCredential(_) => "invalid_credential",
            Error::ExpiryImminent { .. } => "expiry_imminent",
            Error::BindingApplicationFailed { .. } => "binding_application_failed",
            Error::InvalidPolicy(_) => "invalid_policy",
            Error::NotStarted => "not_started",
            Error::AlreadyStarted => "already_started",
            Error::Stopped => "stopped",
        }
    }

    /// Whether the retry policy applies to this error.
    ///
    /// Every fetch failure is retried the same way regardless of its kind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::FetchFailed(_) | Error::InvalidCredential(_))
    }
}

/// Result alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_failures_keep_the_fetcher_kind() {
        let err: Error = FetchError::Unauthorized("revoked".into()).into();
        assert_eq!(err.kind(), "unauthorized");
        assert!(err.is_retryable());

        let escalated = Error::ExpiryImminent {
            last: Box::new(err),
            remaining_ms: 3000,
        };
        assert_eq!(escalated.kind(), "expiry_imminent");
        assert!(!escalated.is_retryable());
        let msg = escalated.to_string();
        assert!(msg.contains("3000ms"), "got: {msg}");
        assert!(msg.contains("revoked"), "got: {msg}");
    }

    #[test]
    fn invalid_credential_is_retried_like_a_fetch_failure() {
        let err = Error::InvalidCredential("expired on arrival".into());
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "invalid_credential");
    }

    #[test]
    fn error_debug_includes_variant() {
        let err = Error::BindingApplicationFailed {
            binding: 7,
            message: "socket closed".into(),
        };
        let debug = format!("{err:?}");
        assert!(
            debug.contains("BindingApplicationFailed"),
            "Debug should include variant name, got: {debug}"
        );
        assert!(err.to_string().contains("binding 7"));
    }
}
