//! Token fetcher contract
//!
//! The fetcher is the only component that talks to the outside world. It is
//! given a [`FetchRequest`] and produces an unvalidated [`TokenGrant`]; the
//! scheduler validates and stores it. No timeout is applied here: bounding a
//! single fetch is the fetcher's own job.

use std::future::Future;
use std::pin::Pin;

use crate::clock::Timestamp;
use crate::credential::TokenGrant;

/// Why a fetch was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    /// No credential was supplied at startup.
    Initial,
    /// The refresh timer fired ahead of expiry.
    Scheduled,
    /// A previous attempt failed and the backoff elapsed.
    Retry,
    /// A consumer asked for a refresh.
    Manual,
}

impl RefreshReason {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshReason::Initial => "initial",
            RefreshReason::Scheduled => "scheduled",
            RefreshReason::Retry => "retry",
            RefreshReason::Manual => "manual",
        }
    }
}

/// Parameters handed to the fetcher for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// 1-based attempt number within the current refresh cycle.
    pub attempt: u32,
    pub reason: RefreshReason,
    /// Expiry of the credential being replaced, if any.
    pub current_expires_at: Option<Timestamp>,
}

/// Failures a fetcher may report.
///
/// The retry policy treats every kind the same; the kind survives into
/// escalation events so the owner can tell a dead network from a revoked
/// grant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("malformed token response: {0}")]
    Malformed(String),
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Transport(_) => "transport",
            FetchError::Unauthorized(_) => "unauthorized",
            FetchError::Malformed(_) => "malformed",
        }
    }
}

/// Boxed future returned by [`TokenFetcher::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<TokenGrant, FetchError>> + Send + 'a>>;

/// Source of fresh credentials.
///
/// Returns a boxed future so the scheduler can hold an `Arc<dyn TokenFetcher>`.
pub trait TokenFetcher: Send + Sync + 'static {
    fn fetch(&self, request: FetchRequest) -> FetchFuture<'_>;
}
