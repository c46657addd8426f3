//! Refresh scheduler
//!
//! Two layers, split the same way as any state machine in this workspace:
//!
//! - [`handle_event`]: pure transition function. Receives the current
//!   [`RefreshState`], an event and a [`TransitionContext`] (clock reading,
//!   current expiry, policy) and returns the next state plus one
//!   [`RefreshAction`]. No I/O, no timers.
//! - [`RefreshScheduler`]: owns a single tokio task (the driver) that feeds
//!   events into `handle_event` and executes the resulting actions: arming
//!   timers on the [`Clock`], spawning fetches, publishing events.
//!
//! Store notifications reach the driver through its command channel, so
//! re-arming after an update always happens on a later loop turn, never
//! inside `CredentialStore::set_credential`.
//!
//! States:
//! - Idle → Fetching (refresh requested, no credential yet)
//! - Idle/Applied/Scheduled/Retrying/Escalated → Scheduled (credential stored)
//! - Scheduled → Fetching (timer fired)
//! - Fetching → Applied (new credential stored)
//! - Fetching → Retrying (fetch failed, time left for another attempt)
//! - Fetching → Escalated (fetch failed, expiry within the safety floor)
//! - Retrying → Fetching (backoff elapsed or manual refresh)

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, TimerHandle, Timestamp, duration_ms};
use crate::credential::{Credential, RefreshSchedule, TokenGrant};
use crate::error::{Error, Result};
use crate::events::ManagerEvent;
use crate::fetcher::{FetchError, FetchRequest, RefreshReason, TokenFetcher};
use crate::metrics;
use crate::policy::RefreshPolicy;
use crate::store::{CredentialStore, Subscription};

/// Scheduler state.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshState {
    /// Nothing scheduled, nothing in flight.
    Idle,
    /// Proactive refresh timer armed.
    Scheduled { schedule: RefreshSchedule },
    /// Exactly one fetch in flight.
    Fetching { attempt: u32, reason: RefreshReason },
    /// Fetched credential stored; waiting for the store notification to re-arm.
    Applied { expires_at: Timestamp },
    /// Last attempt failed; retry timer armed.
    Retrying {
        attempt: u32,
        retry_at: Timestamp,
        last_error: Error,
    },
    /// Retries exhausted within the safety floor.
    Escalated { error: Error },
}

impl RefreshState {
    pub fn phase(&self) -> RefreshPhase {
        match self {
            RefreshState::Idle => RefreshPhase::Idle,
            RefreshState::Scheduled { .. } => RefreshPhase::Scheduled,
            RefreshState::Fetching { .. } => RefreshPhase::Fetching,
            RefreshState::Applied { .. } => RefreshPhase::Applied,
            RefreshState::Retrying { .. } => RefreshPhase::Retrying,
            RefreshState::Escalated { .. } => RefreshPhase::Escalated,
        }
    }
}

/// Summary of [`RefreshState`] for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Scheduled,
    Fetching,
    Applied,
    Retrying,
    Escalated,
    Stopped,
}

impl RefreshPhase {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshPhase::Idle => "idle",
            RefreshPhase::Scheduled => "scheduled",
            RefreshPhase::Fetching => "fetching",
            RefreshPhase::Applied => "applied",
            RefreshPhase::Retrying => "retrying",
            RefreshPhase::Escalated => "escalated",
            RefreshPhase::Stopped => "stopped",
        }
    }
}

/// Inputs to the transition function.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshEvent {
    /// The store now holds a credential expiring at `expires_at`.
    CredentialStored { expires_at: Timestamp },
    /// The armed timer fired.
    TimerFired,
    /// Someone asked for a refresh outside the schedule.
    RefreshRequested { reason: RefreshReason },
    /// The in-flight fetch produced a valid credential. `changed` is false
    /// when it was identical to the stored one (no notification follows).
    FetchSucceeded { expires_at: Timestamp, changed: bool },
    /// The in-flight fetch failed or returned an invalid credential.
    FetchFailed { error: Error },
}

/// Work the driver performs after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshAction {
    /// Arm the proactive refresh timer.
    ArmTimer { fire_at: Timestamp, delay: Duration },
    /// Arm the retry timer after a failed attempt.
    ScheduleRetry {
        attempt: u32,
        delay: Duration,
        error: Error,
    },
    /// Cancel any timer and issue exactly one fetch.
    StartFetch(FetchRequest),
    /// Cancel any timer and report `ExpiryImminent`.
    Escalate { error: Error },
    None,
}

/// Environment of one transition.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    pub now: Timestamp,
    /// Expiry of the credential currently in the store.
    pub current_expires_at: Option<Timestamp>,
    pub policy: &'a RefreshPolicy,
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(
    state: RefreshState,
    event: RefreshEvent,
    ctx: &TransitionContext<'_>,
) -> (RefreshState, RefreshAction) {
    match (state, event) {
        // --- Single flight: an outstanding fetch absorbs triggers ---
        (
            state @ RefreshState::Fetching { .. },
            RefreshEvent::CredentialStored { .. }
            | RefreshEvent::TimerFired
            | RefreshEvent::RefreshRequested { .. },
        ) => (state, RefreshAction::None),

        // --- New credential: (re)compute the schedule ---
        (RefreshState::Applied { .. }, RefreshEvent::CredentialStored { expires_at }) => {
            schedule_after_fetch(expires_at, ctx)
        }
        (_, RefreshEvent::CredentialStored { expires_at }) => schedule(expires_at, ctx),

        // --- Timer ---
        (RefreshState::Scheduled { .. }, RefreshEvent::TimerFired) => {
            start_fetch(1, RefreshReason::Scheduled, ctx)
        }
        (RefreshState::Retrying { attempt, .. }, RefreshEvent::TimerFired) => {
            start_fetch(attempt + 1, RefreshReason::Retry, ctx)
        }
        (state, RefreshEvent::TimerFired) => (state, RefreshAction::None),

        // --- Manual / initial refresh ---
        (RefreshState::Retrying { attempt, .. }, RefreshEvent::RefreshRequested { reason }) => {
            start_fetch(attempt + 1, reason, ctx)
        }
        (_, RefreshEvent::RefreshRequested { reason }) => start_fetch(1, reason, ctx),

        // --- Fetch outcome ---
        (RefreshState::Fetching { .. }, RefreshEvent::FetchSucceeded { expires_at, changed }) => {
            if changed {
                (RefreshState::Applied { expires_at }, RefreshAction::None)
            } else {
                // No store notification will follow an identical credential.
                schedule_after_fetch(expires_at, ctx)
            }
        }
        (RefreshState::Fetching { attempt, .. }, RefreshEvent::FetchFailed { error }) => {
            retry_or_escalate(attempt, error, ctx)
        }

        // Outcome of a fetch this state no longer waits for.
        (
            state,
            RefreshEvent::FetchSucceeded { .. } | RefreshEvent::FetchFailed { .. },
        ) => (state, RefreshAction::None),
    }
}

fn schedule(expires_at: Timestamp, ctx: &TransitionContext<'_>) -> (RefreshState, RefreshAction) {
    arm_schedule(RefreshSchedule::compute(expires_at, ctx.policy.margin, ctx.now), ctx)
}

/// Schedule for a credential that was just fetched. A token already inside
/// the margin waits half its remaining life (at least `backoff_base`)
/// instead of being refetched straight away.
fn schedule_after_fetch(
    expires_at: Timestamp,
    ctx: &TransitionContext<'_>,
) -> (RefreshState, RefreshAction) {
    let remaining = Duration::from_millis(expires_at.saturating_sub(ctx.now));
    let min_gap = (remaining / 2).max(ctx.policy.backoff_base);
    arm_schedule(
        RefreshSchedule::paced(expires_at, ctx.policy.margin, min_gap, ctx.now),
        ctx,
    )
}

fn arm_schedule(
    schedule: RefreshSchedule,
    ctx: &TransitionContext<'_>,
) -> (RefreshState, RefreshAction) {
    let delay = schedule.delay(ctx.now);
    (
        RefreshState::Scheduled { schedule },
        RefreshAction::ArmTimer {
            fire_at: schedule.next_fire_at,
            delay,
        },
    )
}

fn start_fetch(
    attempt: u32,
    reason: RefreshReason,
    ctx: &TransitionContext<'_>,
) -> (RefreshState, RefreshAction) {
    (
        RefreshState::Fetching { attempt, reason },
        RefreshAction::StartFetch(FetchRequest {
            attempt,
            reason,
            current_expires_at: ctx.current_expires_at,
        }),
    )
}

/// Retry after backoff unless the stored credential is already inside the
/// safety floor.
fn retry_or_escalate(
    attempt: u32,
    error: Error,
    ctx: &TransitionContext<'_>,
) -> (RefreshState, RefreshAction) {
    let delay = ctx.policy.backoff_with_jitter(attempt);

    if let Some(expires_at) = ctx.current_expires_at {
        let remaining = expires_at.saturating_sub(ctx.now);
        let floor = duration_ms(ctx.policy.safety_floor);
        if remaining < floor {
            let error = Error::ExpiryImminent {
                last: Box::new(error),
                remaining_ms: remaining,
            };
            return (
                RefreshState::Escalated {
                    error: error.clone(),
                },
                RefreshAction::Escalate { error },
            );
        }
    }

    (
        RefreshState::Retrying {
            attempt,
            retry_at: ctx.now.saturating_add(duration_ms(delay)),
            last_error: error.clone(),
        },
        RefreshAction::ScheduleRetry {
            attempt,
            delay,
            error,
        },
    )
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

type Waiter = oneshot::Sender<Result<Arc<Credential>>>;

enum Command {
    Stored {
        expires_at: Timestamp,
    },
    TimerFired {
        seq: u64,
    },
    Refresh {
        reason: RefreshReason,
        reply: Option<Waiter>,
    },
    FetchDone {
        generation: u64,
        result: std::result::Result<TokenGrant, FetchError>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

enum Lifecycle {
    NotStarted,
    Running {
        commands: mpsc::UnboundedSender<Command>,
        task: JoinHandle<()>,
    },
    Stopped,
}

/// Keeps the stored credential fresh.
///
/// The only writer of the [`CredentialStore`] and the only caller of the
/// [`TokenFetcher`]. At most one fetch is in flight at any time.
pub struct RefreshScheduler {
    clock: Arc<dyn Clock>,
    store: Arc<CredentialStore>,
    fetcher: Arc<dyn TokenFetcher>,
    policy: RefreshPolicy,
    events: broadcast::Sender<ManagerEvent>,
    phase: Arc<watch::Sender<RefreshPhase>>,
    lifecycle: Mutex<Lifecycle>,
}

impl RefreshScheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        store: Arc<CredentialStore>,
        fetcher: Arc<dyn TokenFetcher>,
        policy: RefreshPolicy,
        events: broadcast::Sender<ManagerEvent>,
    ) -> Result<Self> {
        policy.validate()?;
        let (phase, _) = watch::channel(RefreshPhase::Idle);
        Ok(Self {
            clock,
            store,
            fetcher,
            policy,
            events,
            phase: Arc::new(phase),
            lifecycle: Mutex::new(Lifecycle::NotStarted),
        })
    }

    /// Start the refresh cycle. Must be called within a tokio runtime.
    ///
    /// With an initial grant, it is validated and stored and the first
    /// refresh is scheduled from its expiry. Without one, a fetch starts
    /// immediately.
    ///
    /// The store is seeded after the lifecycle lock is released, so store
    /// listeners and bound connections may call back into the scheduler.
    pub fn start(&self, initial: Option<TokenGrant>) -> Result<()> {
        let commands = {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::NotStarted => {}
                Lifecycle::Running { .. } => return Err(Error::AlreadyStarted),
                Lifecycle::Stopped => return Err(Error::Stopped),
            }

            if let Some(grant) = &initial {
                let now = self.clock.now();
                let credential = grant.clone().into_credential(now)?;
                if credential.is_expired(now) {
                    return Err(Error::InvalidCredential(format!(
                        "initial credential expired at {}",
                        credential.expires_at()
                    )));
                }
            }

            let (commands, receiver) = mpsc::unbounded_channel();
            let notify = commands.clone();
            let subscription = self.store.subscribe(move |change| {
                let _ = notify.send(Command::Stored {
                    expires_at: change.current.expires_at(),
                });
            });

            let driver = Driver {
                state: RefreshState::Idle,
                clock: Arc::clone(&self.clock),
                store: Arc::clone(&self.store),
                fetcher: Arc::clone(&self.fetcher),
                policy: self.policy.clone(),
                events: self.events.clone(),
                phase: Arc::clone(&self.phase),
                commands: commands.clone(),
                timer: None,
                timer_seq: 0,
                generation: 0,
                in_flight: None,
                waiters: Vec::new(),
                _subscription: subscription,
            };
            let task = tokio::spawn(driver.run(receiver));
            *lifecycle = Lifecycle::Running {
                commands: commands.clone(),
                task,
            };
            commands
        };

        let Some(grant) = initial else {
            info!("starting refresh cycle without credential, fetching");
            let _ = commands.send(Command::Refresh {
                reason: RefreshReason::Initial,
                reply: None,
            });
            return Ok(());
        };

        let expires_at = grant.expires_at;
        info!(expires_at, "starting refresh cycle with initial credential");
        match self.store.set_credential(grant) {
            Ok(true) => {}
            Ok(false) => {
                // Already current: no notification, so schedule explicitly.
                let _ = commands.send(Command::Stored { expires_at });
            }
            Err(e) => {
                self.abandon_start();
                return Err(e);
            }
        }

        if matches!(*self.lifecycle.lock(), Lifecycle::Stopped) {
            // A concurrent stop() may have cleared the store before the seed landed.
            self.store.clear();
        }
        Ok(())
    }

    /// Undo a `start()` whose seeding failed.
    fn abandon_start(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if !matches!(*lifecycle, Lifecycle::Running { .. }) {
            return;
        }
        if let Lifecycle::Running { task, .. } =
            std::mem::replace(&mut *lifecycle, Lifecycle::NotStarted)
        {
            task.abort();
        }
    }

    /// Refresh now, outside the schedule.
    ///
    /// While a fetch is in flight the request attaches to it instead of
    /// issuing another. Resolves with the stored credential, or with the
    /// error of the attempt it attached to.
    pub async fn refresh_now(&self) -> Result<Arc<Credential>> {
        let commands = match &*self.lifecycle.lock() {
            Lifecycle::Running { commands, .. } => commands.clone(),
            Lifecycle::NotStarted => return Err(Error::NotStarted),
            Lifecycle::Stopped => return Err(Error::Stopped),
        };

        let (reply, response) = oneshot::channel();
        commands
            .send(Command::Refresh {
                reason: RefreshReason::Manual,
                reply: Some(reply),
            })
            .map_err(|_| Error::Stopped)?;
        response.await.map_err(|_| Error::Stopped)?
    }

    /// Stop the cycle: cancel the timer, drop any in-flight fetch result,
    /// clear the store and unsubscribe. Idempotent.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        let Lifecycle::Running { commands, task } = previous else {
            self.phase.send_replace(RefreshPhase::Stopped);
            return;
        };

        let (reply, done) = oneshot::channel();
        if commands.send(Command::Stop { reply }).is_ok() {
            let _ = done.await;
        }
        let _ = task.await;
    }

    pub fn phase(&self) -> RefreshPhase {
        *self.phase.borrow()
    }

    /// Receiver that observes every phase change.
    pub fn watch_phase(&self) -> watch::Receiver<RefreshPhase> {
        self.phase.subscribe()
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        if let Lifecycle::Running { task, .. } = &*self.lifecycle.lock() {
            task.abort();
        }
    }
}

struct Driver {
    state: RefreshState,
    clock: Arc<dyn Clock>,
    store: Arc<CredentialStore>,
    fetcher: Arc<dyn TokenFetcher>,
    policy: RefreshPolicy,
    events: broadcast::Sender<ManagerEvent>,
    phase: Arc<watch::Sender<RefreshPhase>>,
    commands: mpsc::UnboundedSender<Command>,
    /// Armed timer and the sequence number its callback reports.
    timer: Option<(u64, TimerHandle)>,
    timer_seq: u64,
    /// Ticket of the current fetch; results carrying another value are dropped.
    generation: u64,
    in_flight: Option<JoinHandle<()>>,
    waiters: Vec<Waiter>,
    _subscription: Subscription,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Stored { expires_at } => {
                    self.step(RefreshEvent::CredentialStored { expires_at });
                }
                Command::TimerFired { seq } => {
                    if self.timer.is_some_and(|(armed, _)| armed == seq) {
                        self.timer = None;
                        self.step(RefreshEvent::TimerFired);
                    } else {
                        debug!(seq, "stale timer ignored");
                    }
                }
                Command::Refresh { reason, reply } => {
                    if let Some(reply) = reply {
                        self.waiters.push(reply);
                    }
                    if matches!(self.state, RefreshState::Fetching { .. }) {
                        debug!(
                            reason = reason.label(),
                            "fetch already in flight, attaching"
                        );
                    }
                    self.step(RefreshEvent::RefreshRequested { reason });
                }
                Command::FetchDone { generation, result } => {
                    if generation != self.generation {
                        debug!(generation, current = self.generation, "late fetch result dropped");
                        continue;
                    }
                    self.in_flight = None;
                    self.complete_fetch(result);
                }
                Command::Stop { reply } => {
                    self.shutdown();
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    fn step(&mut self, event: RefreshEvent) {
        let ctx = TransitionContext {
            now: self.clock.now(),
            current_expires_at: self.store.credential().map(|c| c.expires_at()),
            policy: &self.policy,
        };
        let state = std::mem::replace(&mut self.state, RefreshState::Idle);
        let (next, action) = handle_event(state, event, &ctx);
        let now = ctx.now;
        self.state = next;
        self.phase.send_replace(self.state.phase());
        self.execute(action, now);
    }

    fn execute(&mut self, action: RefreshAction, now: Timestamp) {
        match action {
            RefreshAction::ArmTimer { fire_at, delay } => {
                self.arm(delay);
                debug!(fire_at, delay_ms = duration_ms(delay), "refresh scheduled");
                let _ = self.events.send(ManagerEvent::Scheduled { fire_at, delay });
            }
            RefreshAction::ScheduleRetry {
                attempt,
                delay,
                error,
            } => {
                self.arm(delay);
                warn!(
                    attempt,
                    delay_ms = duration_ms(delay),
                    error = %error,
                    "token refresh failed, retrying"
                );
                let _ = self.events.send(ManagerEvent::RetryScheduled {
                    attempt,
                    delay,
                    error,
                });
            }
            RefreshAction::StartFetch(request) => {
                self.disarm();
                self.generation += 1;
                let generation = self.generation;
                debug!(
                    attempt = request.attempt,
                    reason = request.reason.label(),
                    now,
                    "fetching token"
                );
                let fetcher = Arc::clone(&self.fetcher);
                let commands = self.commands.clone();
                self.in_flight = Some(tokio::spawn(async move {
                    let result = fetcher.fetch(request).await;
                    let _ = commands.send(Command::FetchDone { generation, result });
                }));
            }
            RefreshAction::Escalate { error } => {
                self.disarm();
                let cause = match &error {
                    Error::ExpiryImminent { last, .. } => last.kind(),
                    other => other.kind(),
                };
                error!(error = %error, cause, "credential about to expire, refresh retries exhausted");
                metrics::record_escalation(cause);
                let _ = self.events.send(ManagerEvent::ExpiryImminent { error });
            }
            RefreshAction::None => {}
        }
    }

    fn complete_fetch(&mut self, result: std::result::Result<TokenGrant, FetchError>) {
        let (attempt, reason) = match &self.state {
            RefreshState::Fetching { attempt, reason } => (*attempt, *reason),
            _ => return,
        };
        let now = self.clock.now();

        let outcome = result.map_err(Error::from).and_then(|grant| {
            if grant.expires_at <= now {
                return Err(Error::InvalidCredential(format!(
                    "fetched credential expired at {} (now {now})",
                    grant.expires_at
                )));
            }
            self.store.set_credential(grant)
        });

        match outcome {
            Ok(changed) => {
                let Some(credential) = self.store.credential() else {
                    return;
                };
                let expires_at = credential.expires_at();
                info!(
                    attempt,
                    reason = reason.label(),
                    expires_at,
                    changed,
                    "token refreshed"
                );
                metrics::record_refresh(reason, "success");
                metrics::record_expires_in(credential.remaining(now));
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Ok(Arc::clone(&credential)));
                }
                let _ = self.events.send(ManagerEvent::Refreshed {
                    reason,
                    attempt,
                    expires_at,
                });
                self.step(RefreshEvent::FetchSucceeded {
                    expires_at,
                    changed,
                });
            }
            Err(error) => {
                metrics::record_refresh(reason, error.kind());
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Err(error.clone()));
                }
                self.step(RefreshEvent::FetchFailed { error });
            }
        }
    }

    fn arm(&mut self, delay: Duration) {
        self.disarm();
        self.timer_seq += 1;
        let seq = self.timer_seq;
        let commands = self.commands.clone();
        let handle = self.clock.schedule_once(
            delay,
            Box::new(move || {
                let _ = commands.send(Command::TimerFired { seq });
            }),
        );
        self.timer = Some((seq, handle));
    }

    fn disarm(&mut self) {
        if let Some((_, handle)) = self.timer.take() {
            self.clock.cancel(handle);
        }
    }

    fn shutdown(&mut self) {
        self.disarm();
        self.generation += 1;
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(Error::Stopped));
        }
        self.store.clear();
        self.state = RefreshState::Idle;
        self.phase.send_replace(RefreshPhase::Stopped);
        info!("refresh cycle stopped");
        let _ = self.events.send(ManagerEvent::Stopped);
    }
}
