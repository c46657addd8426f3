//! Credential manager facade
//!
//! Wires one clock, store, binder and scheduler together and owns the event
//! channel they report on. Consumers read the credential, bind connections
//! and watch events; the scheduler is the only writer.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::binder::{BindingId, Connection, ConnectionBinder};
use crate::clock::Clock;
use crate::credential::{Credential, TokenGrant};
use crate::error::Result;
use crate::events::{EVENT_CHANNEL_CAPACITY, ManagerEvent};
use crate::fetcher::TokenFetcher;
use crate::policy::RefreshPolicy;
use crate::scheduler::{RefreshPhase, RefreshScheduler};
use crate::store::{CredentialStore, Subscription};

/// Proactively refreshed credential shared with bound connections.
pub struct CredentialManager {
    clock: Arc<dyn Clock>,
    store: Arc<CredentialStore>,
    binder: Arc<ConnectionBinder>,
    scheduler: RefreshScheduler,
    events: broadcast::Sender<ManagerEvent>,
    _binder_subscription: Subscription,
}

impl CredentialManager {
    /// Build a manager with an empty store. Nothing runs until [`start`](Self::start).
    pub fn new(
        clock: Arc<dyn Clock>,
        fetcher: Arc<dyn TokenFetcher>,
        policy: RefreshPolicy,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let store = Arc::new(CredentialStore::new(Arc::clone(&clock)));
        let binder = Arc::new(ConnectionBinder::new(Arc::clone(&store), events.clone()));

        let weak_binder = Arc::downgrade(&binder);
        let binder_subscription = store.subscribe(move |change| {
            if let Some(binder) = weak_binder.upgrade() {
                binder.apply_all(&change.current);
            }
        });

        let scheduler = RefreshScheduler::new(
            Arc::clone(&clock),
            Arc::clone(&store),
            fetcher,
            policy,
            events.clone(),
        )?;

        Ok(Self {
            clock,
            store,
            binder,
            scheduler,
            events,
            _binder_subscription: binder_subscription,
        })
    }

    /// Start the refresh cycle, optionally seeded with a known credential.
    pub fn start(&self, initial: Option<TokenGrant>) -> Result<()> {
        self.scheduler.start(initial)
    }

    /// Current credential. Never blocks and never returns a partial update.
    pub fn credential(&self) -> Option<Arc<Credential>> {
        self.store.credential()
    }

    /// Force a refresh, sharing any fetch already in flight.
    pub async fn refresh_now(&self) -> Result<Arc<Credential>> {
        self.scheduler.refresh_now().await
    }

    /// Bind a connection; it receives the current credential now and every
    /// replacement afterwards.
    pub fn bind<C: Connection>(&self, connection: &Arc<C>) -> BindingId {
        self.binder.bind(connection)
    }

    pub fn unbind(&self, id: BindingId) {
        self.binder.unbind(id);
    }

    /// Credential last applied successfully to a binding.
    pub fn bound_value(&self, id: BindingId) -> Option<Arc<Credential>> {
        self.binder.bound_value(id)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self) -> RefreshPhase {
        self.scheduler.phase()
    }

    pub fn watch_phase(&self) -> watch::Receiver<RefreshPhase> {
        self.scheduler.watch_phase()
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn policy(&self) -> &RefreshPolicy {
        self.scheduler.policy()
    }

    /// Stop refreshing and clear the credential. Idempotent.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }
}
