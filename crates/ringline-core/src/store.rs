//! Call session store.
//!
//! Sessions live in a sharded map keyed by call ID. Each session sits
//! behind its own async mutex, so every transition on one call is
//! serialized while unrelated calls never contend. Tokio's mutex is fair:
//! contenders acquire it in the order they queued.
//!
//! Timed states (`ringing`, and `connected` when an inactivity timeout is
//! configured) own a timer task. Every commit bumps the session's timer
//! generation, so a timer that lost a race with a transition finds a newer
//! generation and does nothing.

use crate::audit::AuditSink;
use crate::call::{CallId, CallSession, CallSnapshot, CallState, EndReason, TransitionRecord};
use crate::error::SignalError;
use crate::identity::Identity;
use crate::task::{ticker, TaskSlot};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Call store configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallConfig {
    /// How long a call may ring before it ends with `timeout`.
    pub ringing_timeout: Duration,
    /// Idle time after which a connected call ends with `timeout`.
    pub connected_inactivity_timeout: Option<Duration>,
    /// How long ended calls stay queryable.
    pub terminal_retention: Duration,
    /// Interval of the reaper.
    pub reap_interval: Duration,
    /// Capacity of the termination stream.
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ringing_timeout: Duration::from_secs(60),
            connected_inactivity_timeout: Some(Duration::from_secs(300)),
            terminal_retention: Duration::from_secs(60),
            reap_interval: Duration::from_secs(10),
            event_capacity: 1024,
        }
    }
}

/// A call ended by the store itself rather than by a participant.
#[derive(Debug, Clone, PartialEq)]
pub struct Termination {
    pub call_id: CallId,
    pub caller: Identity,
    pub callee: Identity,
    pub reason: EndReason,
}

/// Counters reported by [`CallStore::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Calls not yet ended or failed.
    pub live: usize,
    /// Ended calls still retained.
    pub retained: usize,
    /// Invariant violations detected since startup.
    pub invariant_violations: u64,
}

struct CallRecord {
    session: CallSession,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    ended_at: Option<Instant>,
}

impl CallRecord {
    fn cancel_timer(&mut self) {
        self.timer_generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct CallSlot {
    id: CallId,
    caller: Identity,
    callee: Identity,
    terminal: AtomicBool,
    record: Arc<Mutex<CallRecord>>,
}

impl CallSlot {
    fn involves(&self, identity: &Identity) -> bool {
        self.caller == *identity || self.callee == *identity
    }

    fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }
}

struct Shared {
    config: CallConfig,
    audit: Arc<dyn AuditSink>,
    terminations: broadcast::Sender<Termination>,
    invariant_violations: AtomicU64,
}

/// Owner of every call session.
pub struct CallStore {
    calls: DashMap<CallId, Arc<CallSlot>>,
    shared: Arc<Shared>,
    reaper: TaskSlot,
}

impl CallStore {
    /// Create a store with default configuration.
    #[must_use]
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self::with_config(CallConfig::default(), audit)
    }

    #[must_use]
    pub fn with_config(config: CallConfig, audit: Arc<dyn AuditSink>) -> Self {
        info!("Creating call store with config: {:?}", config);
        let (terminations, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            calls: DashMap::new(),
            shared: Arc::new(Shared {
                config,
                audit,
                terminations,
                invariant_violations: AtomicU64::new(0),
            }),
            reaper: TaskSlot::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CallConfig {
        &self.shared.config
    }

    /// Subscribe to store-initiated terminations (timeouts).
    #[must_use]
    pub fn subscribe_terminations(&self) -> broadcast::Receiver<Termination> {
        self.shared.terminations.subscribe()
    }

    /// Create a session in `initiating` and return it locked.
    pub async fn create(&self, caller: Identity, callee: Identity) -> CallGuard {
        loop {
            let id = CallId::generate();
            let session = CallSession::new(id.clone(), caller.clone(), callee.clone());
            let record = Arc::new(Mutex::new(CallRecord {
                session,
                timer: None,
                timer_generation: 0,
                ended_at: None,
            }));
            let slot = Arc::new(CallSlot {
                id: id.clone(),
                caller: caller.clone(),
                callee: callee.clone(),
                terminal: AtomicBool::new(false),
                record: Arc::clone(&record),
            });

            // Lock before publishing so no one observes the session half-made.
            let guard = record.lock_owned().await;

            match self.calls.entry(id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    vacant.insert(Arc::clone(&slot));
                }
            }

            if let Some(created) = guard.session.history().first() {
                self.shared.audit.record(created);
            }
            debug!(call_id = %slot.id, caller = %caller, callee = %callee, "Call created");

            return CallGuard {
                shared: Arc::clone(&self.shared),
                slot,
                record: guard,
            };
        }
    }

    /// Lock the session for `call_id`, waiting behind earlier lockers.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::InvalidState`] if the call does not exist and
    /// [`SignalError::Internal`] if a live session lost its store entry.
    pub async fn lock(&self, call_id: &CallId) -> Result<CallGuard, SignalError> {
        let slot = self
            .calls
            .get(call_id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| SignalError::invalid_state(Some(call_id), format!("unknown call {call_id}")))?;

        let record = Arc::clone(&slot.record).lock_owned().await;

        if !record.session.state().is_terminal() && !self.calls.contains_key(call_id) {
            self.shared
                .invariant_violations
                .fetch_add(1, Ordering::Relaxed);
            error!(
                invariant_violation = true,
                call_id = %call_id,
                state = %record.session.state(),
                "Live call session has no store entry"
            );
            return Err(SignalError::Internal(format!(
                "call {call_id} lost its store entry"
            )));
        }

        Ok(CallGuard {
            shared: Arc::clone(&self.shared),
            slot,
            record,
        })
    }

    /// Caller and callee of a call, without locking it.
    #[must_use]
    pub fn participants(&self, call_id: &CallId) -> Option<(Identity, Identity)> {
        self.calls
            .get(call_id)
            .map(|slot| (slot.caller.clone(), slot.callee.clone()))
    }

    /// Non-terminal calls involving `identity`.
    #[must_use]
    pub fn calls_for(&self, identity: &Identity) -> Vec<CallId> {
        self.calls
            .iter()
            .filter(|slot| !slot.is_terminal() && slot.involves(identity))
            .map(|slot| slot.id.clone())
            .collect()
    }

    /// Every non-terminal call with its participants.
    #[must_use]
    pub fn live_calls(&self) -> Vec<(CallId, Identity, Identity)> {
        self.calls
            .iter()
            .filter(|slot| !slot.is_terminal())
            .map(|slot| (slot.id.clone(), slot.caller.clone(), slot.callee.clone()))
            .collect()
    }

    /// Snapshot of a call, if it is still known.
    pub async fn info(&self, call_id: &CallId) -> Option<CallSnapshot> {
        let slot = self.calls.get(call_id).map(|slot| Arc::clone(slot.value()))?;
        let record = slot.record.lock().await;
        Some(record.session.snapshot())
    }

    /// Drop terminal sessions past their retention. Returns how many went.
    pub fn reap(&self) -> usize {
        let now = Instant::now();
        let retention = self.shared.config.terminal_retention;
        let candidates: Vec<Arc<CallSlot>> = self
            .calls
            .iter()
            .filter(|slot| slot.is_terminal())
            .map(|slot| Arc::clone(slot.value()))
            .collect();

        let mut reaped = 0;
        for slot in candidates {
            // A locked session is in use; it gets another chance next round.
            let Ok(record) = slot.record.try_lock() else {
                continue;
            };
            let expired = record
                .ended_at
                .is_some_and(|ended| now.saturating_duration_since(ended) >= retention);
            drop(record);
            if expired && self.calls.remove(&slot.id).is_some() {
                reaped += 1;
            }
        }

        if reaped > 0 {
            debug!(reaped, "Reaped ended calls");
        }
        reaped
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            invariant_violations: self.shared.invariant_violations.load(Ordering::Relaxed),
            ..StoreStats::default()
        };
        for slot in self.calls.iter() {
            if slot.is_terminal() {
                stats.retained += 1;
            } else {
                stats.live += 1;
            }
        }
        stats
    }

    /// Number of sessions, retained ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Start the reaper.
    pub fn start(self: &Arc<Self>) {
        let store = Arc::downgrade(self);
        let period = self.shared.config.reap_interval;
        let handle = tokio::spawn(async move {
            let mut interval = ticker(period);
            loop {
                interval.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.reap();
            }
        });
        self.reaper.replace(handle);
        info!(interval_ms = period.as_millis() as u64, "Call reaper started");
    }

    /// Stop the reaper and cancel idle session timers.
    pub fn stop(&self) {
        self.reaper.abort();
        for slot in self.calls.iter() {
            if let Ok(mut record) = slot.record.try_lock() {
                record.cancel_timer();
            }
        }
    }
}

impl Drop for CallStore {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

/// Exclusive access to one call session.
///
/// Holding the guard serializes against every other operation on the call.
pub struct CallGuard {
    shared: Arc<Shared>,
    slot: Arc<CallSlot>,
    record: OwnedMutexGuard<CallRecord>,
}

impl CallGuard {
    #[must_use]
    pub fn id(&self) -> &CallId {
        &self.slot.id
    }

    #[must_use]
    pub fn session(&self) -> &CallSession {
        &self.record.session
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        self.record.session.state()
    }

    /// Apply a transition, audit it and re-arm timers for the new state.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::InvalidState`] if the state machine has no
    /// such edge from the current state.
    pub fn transition(
        &mut self,
        to: CallState,
        reason: Option<EndReason>,
    ) -> Result<TransitionRecord, SignalError> {
        commit(&self.shared, &self.slot, &mut self.record, to, reason)
    }

    /// Record activity without changing state.
    pub fn touch(&mut self) {
        self.record.session.touch();
        if self.record.session.state() == CallState::Connected {
            if let Some(idle) = self.shared.config.connected_inactivity_timeout {
                arm(&self.shared, &self.slot, &mut self.record, idle);
            }
        }
    }
}

fn commit(
    shared: &Arc<Shared>,
    slot: &Arc<CallSlot>,
    record: &mut CallRecord,
    to: CallState,
    reason: Option<EndReason>,
) -> Result<TransitionRecord, SignalError> {
    let entry = record.session.transition(to, reason)?;
    shared.audit.record(&entry);
    debug!(
        call_id = %slot.id,
        from = entry.from_state.map(|s| s.as_str()).unwrap_or("-"),
        to = %to,
        reason = reason.map(|r| r.as_str()).unwrap_or("-"),
        "Call transition"
    );

    if to.is_terminal() {
        record.cancel_timer();
        record.ended_at = Some(Instant::now());
        slot.terminal.store(true, Ordering::Release);
    } else {
        match to {
            CallState::Ringing => arm(shared, slot, record, shared.config.ringing_timeout),
            CallState::Connected => match shared.config.connected_inactivity_timeout {
                Some(idle) => arm(shared, slot, record, idle),
                None => record.cancel_timer(),
            },
            _ => record.cancel_timer(),
        }
    }

    Ok(entry)
}

fn arm(shared: &Arc<Shared>, slot: &Arc<CallSlot>, record: &mut CallRecord, after: Duration) {
    record.cancel_timer();
    let generation = record.timer_generation;
    let shared = Arc::clone(shared);
    let slot = Arc::downgrade(slot);
    record.timer = Some(tokio::spawn(async move {
        tokio::time::sleep(after).await;
        if let Some(slot) = slot.upgrade() {
            expire(&shared, &slot, generation).await;
        }
    }));
}

async fn expire(shared: &Arc<Shared>, slot: &Arc<CallSlot>, generation: u64) {
    let mut record = slot.record.lock().await;
    if record.timer_generation != generation || record.session.state().is_terminal() {
        return;
    }
    // This task is the timer; detach rather than abort it.
    record.timer = None;

    let from = record.session.state();
    if commit(shared, slot, &mut record, CallState::Ended, Some(EndReason::Timeout)).is_ok() {
        info!(call_id = %slot.id, state = %from, "Call timed out");
        let _ = shared.terminations.send(Termination {
            call_id: slot.id.clone(),
            caller: slot.caller.clone(),
            callee: slot.callee.clone(),
            reason: EndReason::Timeout,
        });
    }
}
