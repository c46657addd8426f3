//! Token lifecycle library
//!
//! Keeps a short-lived bearer credential fresh and pushes it into every
//! connection that authenticates with it. The crate has no dependency on
//! any concrete token endpoint: callers supply a [`TokenFetcher`].
//!
//! Flow:
//! 1. Owner builds a [`CredentialManager`] with a [`Clock`], a fetcher and a
//!    [`RefreshPolicy`], then calls `start()` with an optional known credential
//! 2. The scheduler arms a timer `margin` before expiry
//! 3. On fire it calls the fetcher once and stores the result
//! 4. The store notifies the binder, which applies the value to each
//!    bound connection, and the scheduler, which re-arms
//! 5. Failures retry with exponential backoff until the credential gets too
//!    close to expiry, at which point `ExpiryImminent` is reported

pub mod binder;
pub mod clock;
pub mod credential;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod manager;
pub mod metrics;
pub mod policy;
pub mod scheduler;
mod secret;
pub mod store;

pub use binder::{BindingId, BoxError, Connection, ConnectionBinder};
pub use clock::{Clock, ManualClock, TimerCallback, TimerHandle, Timestamp, TokioClock};
pub use credential::{Credential, RefreshSchedule, TokenGrant};
pub use error::{Error, Result};
pub use events::ManagerEvent;
pub use fetcher::{FetchError, FetchFuture, FetchRequest, RefreshReason, TokenFetcher};
pub use manager::CredentialManager;
pub use policy::RefreshPolicy;
pub use scheduler::{RefreshPhase, RefreshScheduler};
pub use secret::Secret;
pub use store::{CredentialChange, CredentialStore, Subscription};
