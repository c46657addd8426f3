//! In-memory credential store with change notification
//!
//! Holds at most one current [`Credential`]. Reads are lock-free through
//! `ArcSwapOption`, so a reader sees either the old or the new credential,
//! never a mix. Writes are serialized by a mutex and notify every listener
//! synchronously with the `(previous, current)` pair.
//!
//! Listeners are invoked after the write lock is released. A listener may
//! read the store; re-arming work (the scheduler) is queued by the listener
//! and performed later, never inside the notification pass.

use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::debug;

use crate::clock::Clock;
use crate::credential::{Credential, TokenGrant};
use crate::error::Result;

/// A credential replacement delivered to listeners.
#[derive(Debug, Clone)]
pub struct CredentialChange {
    pub previous: Option<Arc<Credential>>,
    pub current: Arc<Credential>,
}

type Listener = Arc<dyn Fn(&CredentialChange) + Send + Sync>;

struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

/// Single-slot credential holder.
pub struct CredentialStore {
    clock: Arc<dyn Clock>,
    current: ArcSwapOption<Credential>,
    write_lock: Mutex<()>,
    listeners: Arc<Mutex<Listeners>>,
}

impl CredentialStore {
    /// Create an empty store. `clock` stamps grants that arrive without an
    /// issuance time.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            current: ArcSwapOption::empty(),
            write_lock: Mutex::new(()),
            listeners: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Replace the current credential.
    ///
    /// Returns `Ok(false)` without notifying anyone when the grant is
    /// structurally identical to the current credential: same value and
    /// expiry, and the same issuance time when the grant carries one. Fails
    /// with `InvalidCredential` when the grant does not validate; the store
    /// is left untouched in that case.
    pub fn set_credential(&self, grant: TokenGrant) -> Result<bool> {
        let explicit_issued_at = grant.issued_at.is_some();
        let credential = grant.into_credential(self.clock.now())?;

        let change = {
            let _guard = self.write_lock.lock();
            let previous = self.current.load_full();
            let identical = previous.as_deref().is_some_and(|prev| {
                prev.value() == credential.value()
                    && prev.expires_at() == credential.expires_at()
                    && (!explicit_issued_at || prev.issued_at() == credential.issued_at())
            });
            if identical {
                debug!(
                    expires_at = credential.expires_at(),
                    "identical credential, skipping update"
                );
                return Ok(false);
            }
            let current = Arc::new(credential);
            self.current.store(Some(Arc::clone(&current)));
            CredentialChange { previous, current }
        };

        debug!(
            issued_at = change.current.issued_at(),
            expires_at = change.current.expires_at(),
            "credential updated"
        );

        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .entries
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&change);
        }
        Ok(true)
    }

    /// Current credential, if any. Never blocks.
    pub fn credential(&self) -> Option<Arc<Credential>> {
        self.current.load_full()
    }

    /// Register a change listener. The listener stays registered until the
    /// returned [`Subscription`] is dropped or unsubscribed.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&CredentialChange) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }

    /// Drop the current credential without notifying listeners.
    pub fn clear(&self) {
        let _guard = self.write_lock.lock();
        if self.current.swap(None).is_some() {
            debug!("credential store cleared");
        }
    }
}

/// Listener registration guard returned by [`CredentialStore::subscribe`].
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    /// Unregister now. Equivalent to dropping the guard.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().entries.retain(|(id, _)| *id != self.id);
        }
    }
}
