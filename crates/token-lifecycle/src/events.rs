//! Events reported to the manager's owner
//!
//! Failures never escape a notification path as panics or errors; they are
//! published here instead. `ExpiryImminent` is the only terminal event: the
//! scheduler stops retrying and waits for outside action.

use std::time::Duration;

use crate::binder::BindingId;
use crate::clock::Timestamp;
use crate::error::Error;
use crate::fetcher::RefreshReason;

/// Capacity of the broadcast channel behind [`ManagerEvent`].
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// The proactive refresh timer was armed.
    Scheduled { fire_at: Timestamp, delay: Duration },
    /// A fetched credential was validated and stored.
    Refreshed {
        reason: RefreshReason,
        attempt: u32,
        expires_at: Timestamp,
    },
    /// A fetch failed; another attempt follows after `delay`.
    RetryScheduled {
        attempt: u32,
        delay: Duration,
        error: Error,
    },
    /// Retrying can no longer beat expiry. Requires external action.
    ExpiryImminent { error: Error },
    /// A bound connection rejected the credential. Scheduling continues.
    BindingApplicationFailed { binding: BindingId, error: Error },
    /// The manager was stopped.
    Stopped,
}

impl ManagerEvent {
    pub fn label(&self) -> &'static str {
        match self {
            ManagerEvent::Scheduled { .. } => "scheduled",
            ManagerEvent::Refreshed { .. } => "refreshed",
            ManagerEvent::RetryScheduled { .. } => "retry_scheduled",
            ManagerEvent::ExpiryImminent { .. } => "expiry_imminent",
            ManagerEvent::BindingApplicationFailed { .. } => "binding_application_failed",
            ManagerEvent::Stopped => "stopped",
        }
    }

    /// Whether the owner must intervene (re-authenticate, restart).
    pub fn is_terminal(&self) -> bool {
        matches!(self, ManagerEvent::ExpiryImminent { .. })
    }
}
