//! Connection binder
//!
//! Pushes the current credential into every bound connection whenever the
//! store changes. Connections are owned elsewhere: the binder keeps only
//! `Weak` references and forgets a binding once its connection is dropped.
//!
//! Application is a single pass-through call per connection. Failures are
//! logged, counted and published as `BindingApplicationFailed`; they are
//! never retried and never stop the pass or the refresh cycle.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::credential::Credential;
use crate::error::Error;
use crate::events::ManagerEvent;
use crate::metrics;
use crate::store::CredentialStore;

/// Error type connections report from `apply_credential`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A live resource that authenticates with the current token.
pub trait Connection: Send + Sync + 'static {
    /// Label used in logs.
    fn name(&self) -> &str {
        "connection"
    }

    /// Install `value` as the connection's credential.
    fn apply_credential(&self, value: &str) -> Result<(), BoxError>;
}

/// Identifier of one binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(u64);

impl BindingId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Binding {
    connection: Weak<dyn Connection>,
    /// Last credential this connection accepted.
    applied: Option<Arc<Credential>>,
}

/// Applies store updates to bound connections.
pub struct ConnectionBinder {
    store: Arc<CredentialStore>,
    events: broadcast::Sender<ManagerEvent>,
    next_id: AtomicU64,
    bindings: Mutex<BTreeMap<BindingId, Binding>>,
}

impl ConnectionBinder {
    pub fn new(store: Arc<CredentialStore>, events: broadcast::Sender<ManagerEvent>) -> Self {
        Self {
            store,
            events,
            next_id: AtomicU64::new(1),
            bindings: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register `connection` and apply the current credential to it, if any.
    ///
    /// A credential stored while that apply runs may reach the connection
    /// through [`apply_all`](Self::apply_all) before the older one does, so
    /// the store is re-read afterwards and the newest value applied last.
    pub fn bind<C: Connection>(&self, connection: &Arc<C>) -> BindingId {
        let id = BindingId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let weak: Weak<dyn Connection> = Arc::downgrade(connection) as Weak<dyn Connection>;
        self.bindings.lock().insert(
            id,
            Binding {
                connection: weak,
                applied: None,
            },
        );
        debug!(binding = %id, connection = connection.name(), "connection bound");

        let mut applied: Option<Arc<Credential>> = None;
        while let Some(credential) = self.store.credential() {
            if applied.as_ref().is_some_and(|a| Arc::ptr_eq(a, &credential)) {
                break;
            }
            self.apply_one(id, connection.as_ref(), &credential);
            applied = Some(credential);
        }
        id
    }

    /// Remove a binding. Unknown ids are ignored.
    pub fn unbind(&self, id: BindingId) {
        if self.bindings.lock().remove(&id).is_some() {
            debug!(binding = %id, "connection unbound");
        }
    }

    /// Credential last applied successfully to `id`.
    pub fn bound_value(&self, id: BindingId) -> Option<Arc<Credential>> {
        self.bindings
            .lock()
            .get(&id)
            .and_then(|b| b.applied.clone())
    }

    /// Number of live bindings.
    pub fn len(&self) -> usize {
        self.bindings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `credential` to every bound connection.
    ///
    /// Connections are called without the binding table locked, so a
    /// connection may bind or unbind from inside `apply_credential`.
    pub fn apply_all(&self, credential: &Arc<Credential>) {
        let targets: Vec<(BindingId, Weak<dyn Connection>)> = self
            .bindings
            .lock()
            .iter()
            .map(|(id, b)| (*id, b.connection.clone()))
            .collect();

        let mut dead = Vec::new();
        for (id, weak) in targets {
            match weak.upgrade() {
                Some(connection) => {
                    self.apply_one(id, connection.as_ref(), credential);
                }
                None => dead.push(id),
            }
        }

        if !dead.is_empty() {
            let mut bindings = self.bindings.lock();
            for id in dead {
                bindings.remove(&id);
                debug!(binding = %id, "connection dropped, binding pruned");
            }
        }
    }

    fn apply_one(&self, id: BindingId, connection: &dyn Connection, credential: &Arc<Credential>) {
        match connection.apply_credential(credential.value().expose()) {
            Ok(()) => {
                if let Some(binding) = self.bindings.lock().get_mut(&id) {
                    binding.applied = Some(Arc::clone(credential));
                }
                debug!(
                    binding = %id,
                    connection = connection.name(),
                    expires_at = credential.expires_at(),
                    "credential applied"
                );
            }
            Err(e) => {
                warn!(
                    binding = %id,
                    connection = connection.name(),
                    error = %e,
                    "applying credential to connection failed"
                );
                metrics::record_binding_failure();
                let _ = self.events.send(ManagerEvent::BindingApplicationFailed {
                    binding: id,
                    error: Error::BindingApplicationFailed {
                        binding: id.get(),
                        message: e.to_string(),
                    },
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::credential::TokenGrant;
    use std::sync::atomic::AtomicBool;

    /// Connection double recording every applied value.
    #[derive(Default)]
    struct FakeConnection {
        applied: Mutex<Vec<String>>,
        fail: AtomicBool,
    }

    impl Connection for FakeConnection {
        fn name(&self) -> &str {
            "fake"
        }

        fn apply_credential(&self, value: &str) -> Result<(), BoxError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err("connection closed".into());
            }
            self.applied.lock().push(value.to_owned());
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<CredentialStore>,
        binder: Arc<ConnectionBinder>,
        events: broadcast::Receiver<ManagerEvent>,
        _sub: crate::store::Subscription,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(CredentialStore::new(Arc::new(ManualClock::new(0))));
        let (tx, events) = broadcast::channel(16);
        let binder = Arc::new(ConnectionBinder::new(store.clone(), tx));
        let weak = Arc::downgrade(&binder);
        let sub = store.subscribe(move |change| {
            if let Some(binder) = weak.upgrade() {
                binder.apply_all(&change.current);
            }
        });
        Fixture {
            store,
            binder,
            events,
            _sub: sub,
        }
    }

    #[test]
    fn bind_applies_current_credential_immediately() {
        let fx = fixture();
        fx.store.set_credential(TokenGrant::new("tok-1", 10_000)).unwrap();

        let conn = Arc::new(FakeConnection::default());
        let id = fx.binder.bind(&conn);

        assert_eq!(*conn.applied.lock(), vec!["tok-1"]);
        assert_eq!(fx.binder.bound_value(id).unwrap().value().expose(), "tok-1");
    }

    #[test]
    fn bind_before_first_credential_applies_nothing() {
        let fx = fixture();
        let conn = Arc::new(FakeConnection::default());
        let id = fx.binder.bind(&conn);
        assert!(conn.applied.lock().is_empty());
        assert!(fx.binder.bound_value(id).is_none());
    }

    #[test]
    fn store_changes_reach_every_binding() {
        let fx = fixture();
        let a = Arc::new(FakeConnection::default());
        let b = Arc::new(FakeConnection::default());
        fx.binder.bind(&a);
        fx.binder.bind(&b);

        fx.store.set_credential(TokenGrant::new("tok-1", 10_000)).unwrap();
        fx.store.set_credential(TokenGrant::new("tok-2", 20_000)).unwrap();

        assert_eq!(*a.applied.lock(), vec!["tok-1", "tok-2"]);
        assert_eq!(*b.applied.lock(), vec!["tok-1", "tok-2"]);
    }

    #[test]
    fn unbind_stops_updates_and_ignores_unknown_ids() {
        let fx = fixture();
        let conn = Arc::new(FakeConnection::default());
        let id = fx.binder.bind(&conn);
        fx.binder.unbind(id);
        fx.binder.unbind(id);
        fx.binder.unbind(BindingId(999));

        fx.store.set_credential(TokenGrant::new("tok-1", 10_000)).unwrap();
        assert!(conn.applied.lock().is_empty());
        assert!(fx.binder.is_empty());
    }

    #[test]
    fn failing_connection_does_not_block_others() {
        let mut fx = fixture();
        let broken = Arc::new(FakeConnection::default());
        broken.fail.store(true, Ordering::SeqCst);
        let healthy = Arc::new(FakeConnection::default());
        let broken_id = fx.binder.bind(&broken);
        let healthy_id = fx.binder.bind(&healthy);

        fx.store.set_credential(TokenGrant::new("tok-1", 10_000)).unwrap();

        assert_eq!(*healthy.applied.lock(), vec!["tok-1"]);
        assert!(fx.binder.bound_value(broken_id).is_none());
        assert!(fx.binder.bound_value(healthy_id).is_some());

        match fx.events.try_recv().unwrap() {
            ManagerEvent::BindingApplicationFailed { binding, error } => {
                assert_eq!(binding, broken_id);
                assert!(error.to_string().contains("connection closed"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(fx.events.try_recv().is_err());
    }

    #[test]
    fn dropped_connections_are_pruned() {
        let fx = fixture();
        let conn = Arc::new(FakeConnection::default());
        fx.binder.bind(&conn);
        assert_eq!(fx.binder.len(), 1);

        drop(conn);
        fx.store.set_credential(TokenGrant::new("tok-1", 10_000)).unwrap();
        assert!(fx.binder.is_empty());
    }

    #[test]
    fn failed_application_keeps_previous_bound_value() {
        let fx = fixture();
        let conn = Arc::new(FakeConnection::default());
        let id = fx.binder.bind(&conn);
        fx.store.set_credential(TokenGrant::new("tok-1", 10_000)).unwrap();

        conn.fail.store(true, Ordering::SeqCst);
        fx.store.set_credential(TokenGrant::new("tok-2", 20_000)).unwrap();

        assert_eq!(fx.binder.bound_value(id).unwrap().value().expose(), "tok-1");
    }

    /// Stores a newer credential the first time it is handed `tok-1`, as a
    /// refresh landing between `bind` reading the store and applying.
    struct RacingConnection {
        store: Arc<CredentialStore>,
        raced: AtomicBool,
        applied: Mutex<Vec<String>>,
    }

    impl Connection for RacingConnection {
        fn apply_credential(&self, value: &str) -> Result<(), BoxError> {
            if value == "tok-1" && !self.raced.swap(true, Ordering::SeqCst) {
                self.store.set_credential(TokenGrant::new("tok-2", 20_000))?;
            }
            self.applied.lock().push(value.to_owned());
            Ok(())
        }
    }

    #[test]
    fn bind_racing_a_store_update_ends_on_the_newest_credential() {
        let fx = fixture();
        fx.store.set_credential(TokenGrant::new("tok-1", 10_000)).unwrap();

        let conn = Arc::new(RacingConnection {
            store: fx.store.clone(),
            raced: AtomicBool::new(false),
            applied: Mutex::new(Vec::new()),
        });
        let id = fx.binder.bind(&conn);

        assert_eq!(fx.store.credential().unwrap().value().expose(), "tok-2");
        assert_eq!(fx.binder.bound_value(id).unwrap().value().expose(), "tok-2");
        assert_eq!(*conn.applied.lock(), vec!["tok-2", "tok-1", "tok-2"]);
    }
}
