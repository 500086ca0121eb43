//! Presence tracking for Ringline.
//!
//! The registry maps each identity to its single live connection. Entries
//! are refreshed by heartbeats and expired by a periodic sweep once the
//! grace period passes without one.

use crate::connection::ConnectionHandle;
use crate::error::SignalError;
use crate::identity::Identity;
use crate::task::{ticker, TaskSlot};
use dashmap::DashMap;
use ringline_protocol::{Frame, PeerStatus};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info};

/// Presence registry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceConfig {
    /// How long an entry survives without a heartbeat.
    pub grace_period: Duration,
    /// Heartbeat age after which an entry is marked away.
    pub away_after: Option<Duration>,
    /// Interval of the expiry sweep.
    pub sweep_interval: Duration,
    /// Capacity of the presence event stream.
    pub event_capacity: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            away_after: Some(Duration::from_secs(15)),
            sweep_interval: Duration::from_secs(5),
            event_capacity: 1024,
        }
    }
}

/// Reachability of a present identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
}

impl From<PresenceStatus> for PeerStatus {
    fn from(status: PresenceStatus) -> Self {
        match status {
            PresenceStatus::Online => PeerStatus::Online,
            PresenceStatus::Away => PeerStatus::Away,
        }
    }
}

/// Presence state for a single identity.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    /// The live connection.
    pub connection: ConnectionHandle,
    /// When the connection registered.
    pub connected_at: Instant,
    /// Last heartbeat (registration counts as one).
    pub last_heartbeat: Instant,
    pub status: PresenceStatus,
}

impl PresenceEntry {
    fn new(connection: ConnectionHandle) -> Self {
        let now = Instant::now();
        Self {
            connection,
            connected_at: now,
            last_heartbeat: now,
            status: PresenceStatus::Online,
        }
    }

    /// Time since the last heartbeat.
    #[must_use]
    pub fn heartbeat_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }
}

/// Why an identity went offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineReason {
    /// The connection closed or was unregistered.
    Disconnected,
    /// No heartbeat within the grace period.
    Expired,
}

/// Presence change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Online { identity: Identity },
    Away { identity: Identity },
    Offline {
        identity: Identity,
        reason: OfflineReason,
    },
}

impl PresenceEvent {
    /// Identity the event is about.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        match self {
            PresenceEvent::Online { identity }
            | PresenceEvent::Away { identity }
            | PresenceEvent::Offline { identity, .. } => identity,
        }
    }

    /// Status other clients should see.
    #[must_use]
    pub fn peer_status(&self) -> PeerStatus {
        match self {
            PresenceEvent::Online { .. } => PeerStatus::Online,
            PresenceEvent::Away { .. } => PeerStatus::Away,
            PresenceEvent::Offline { .. } => PeerStatus::Offline,
        }
    }
}

/// Registry of reachable identities.
pub struct PresenceRegistry {
    entries: DashMap<Identity, PresenceEntry>,
    events: broadcast::Sender<PresenceEvent>,
    generation: AtomicU64,
    config: PresenceConfig,
    sweeper: TaskSlot,
}

impl PresenceRegistry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PresenceConfig::default())
    }

    /// Create a registry with custom configuration.
    #[must_use]
    pub fn with_config(config: PresenceConfig) -> Self {
        info!("Creating presence registry with config: {:?}", config);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            entries: DashMap::new(),
            events,
            generation: AtomicU64::new(1),
            config,
            sweeper: TaskSlot::default(),
        }
    }

    /// Registry configuration.
    #[must_use]
    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Subscribe to presence changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PresenceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Bind `identity` to a new connection whose frames go to `outbox`.
    ///
    /// Any previous connection for the identity receives a `superseded`
    /// notice and is closed.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Conflict`] if the identity is malformed.
    pub fn register(
        &self,
        identity: &str,
        connection_id: impl Into<String>,
        outbox: mpsc::UnboundedSender<Frame>,
    ) -> Result<ConnectionHandle, SignalError> {
        let identity = Identity::parse(identity)?;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let handle =
            ConnectionHandle::new(identity.clone(), connection_id.into(), generation, outbox);

        let previous = self
            .entries
            .insert(identity.clone(), PresenceEntry::new(handle.clone()));

        if let Some(previous) = previous {
            info!(
                identity = %identity,
                old = %previous.connection.connection_id(),
                new = %handle.connection_id(),
                "Connection superseded"
            );
            let _ = previous.connection.send(Frame::Superseded {
                connection_id: handle.connection_id().to_string(),
            });
            previous.connection.close();
        } else {
            debug!(identity = %identity, connection = %handle.connection_id(), "Presence: online");
        }

        self.emit(PresenceEvent::Online { identity });
        Ok(handle)
    }

    /// Refresh the heartbeat of `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::NotFound`] if the identity has no connection.
    pub fn heartbeat(&self, identity: &Identity) -> Result<(), SignalError> {
        let was_away = {
            let mut entry = self
                .entries
                .get_mut(identity)
                .ok_or_else(|| SignalError::NotFound(format!("no connection for {identity}")))?;
            entry.last_heartbeat = Instant::now();
            std::mem::replace(&mut entry.status, PresenceStatus::Online) == PresenceStatus::Away
        };

        if was_away {
            debug!(identity = %identity, "Presence: back online");
            self.emit(PresenceEvent::Online {
                identity: identity.clone(),
            });
        }
        Ok(())
    }

    /// Remove `identity` and close its connection. No-op when absent.
    ///
    /// Returns `true` if an entry was removed.
    pub fn unregister(&self, identity: &Identity) -> bool {
        self.remove(identity, OfflineReason::Disconnected)
    }

    /// Expire `identity` as if its grace period had elapsed. No-op when absent.
    pub fn expire(&self, identity: &Identity) -> bool {
        self.remove(identity, OfflineReason::Expired)
    }

    fn remove(&self, identity: &Identity, reason: OfflineReason) -> bool {
        match self.entries.remove(identity) {
            Some((identity, entry)) => {
                entry.connection.close();
                self.went_offline(identity, reason);
                true
            }
            None => false,
        }
    }

    /// Remove the entry only if it is still bound to `handle`.
    ///
    /// A superseded connection closing late leaves its replacement alone.
    pub fn unregister_connection(&self, handle: &ConnectionHandle) -> bool {
        let removed = self
            .entries
            .remove_if(handle.identity(), |_, entry| {
                entry.connection.same_connection(handle)
            });
        match removed {
            Some((identity, _)) => {
                self.went_offline(identity, OfflineReason::Disconnected);
                true
            }
            None => false,
        }
    }

    fn went_offline(&self, identity: Identity, reason: OfflineReason) {
        debug!(identity = %identity, ?reason, "Presence: offline");
        self.emit(PresenceEvent::Offline { identity, reason });
    }

    /// Current connection for `identity`.
    #[must_use]
    pub fn lookup(&self, identity: &Identity) -> Option<ConnectionHandle> {
        self.entries.get(identity).map(|e| e.connection.clone())
    }

    /// Current status for `identity`.
    #[must_use]
    pub fn status(&self, identity: &Identity) -> Option<PresenceStatus> {
        self.entries.get(identity).map(|e| e.status)
    }

    /// Check if an identity has a live connection.
    #[must_use]
    pub fn is_online(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    /// Number of present identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nobody is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Present identities with their status.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(Identity, PresenceStatus)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.status))
            .collect()
    }

    /// Every live connection.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.entries.iter().map(|e| e.connection.clone()).collect()
    }

    /// Expire entries past the grace period and mark idle ones away.
    ///
    /// Works from a snapshot so no shard stays locked for the whole scan.
    /// Returns the expired identities.
    pub fn sweep(&self) -> Vec<Identity> {
        let now = Instant::now();
        let snapshot: Vec<(Identity, u64, Duration, PresenceStatus)> = self
            .entries
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.connection.generation(),
                    e.heartbeat_age(now),
                    e.status,
                )
            })
            .collect();

        let grace = self.config.grace_period;
        let mut expired = Vec::new();

        for (identity, generation, age, status) in snapshot {
            if age > grace {
                // Re-check under the shard lock: a heartbeat or new
                // registration may have landed since the snapshot.
                let removed = self.entries.remove_if(&identity, |_, entry| {
                    entry.connection.generation() == generation && entry.heartbeat_age(now) > grace
                });
                if let Some((identity, entry)) = removed {
                    info!(identity = %identity, age_ms = age.as_millis() as u64, "Presence expired");
                    entry.connection.close();
                    self.went_offline(identity.clone(), OfflineReason::Expired);
                    expired.push(identity);
                }
            } else if status == PresenceStatus::Online
                && self.config.away_after.is_some_and(|away| age > away)
            {
                let marked = match self.entries.get_mut(&identity) {
                    Some(mut entry) if entry.connection.generation() == generation => {
                        entry.status = PresenceStatus::Away;
                        true
                    }
                    _ => false,
                };
                if marked {
                    debug!(identity = %identity, "Presence: away");
                    self.emit(PresenceEvent::Away { identity });
                }
            }
        }

        expired
    }

    /// Start the periodic sweep.
    pub fn start(self: &Arc<Self>) {
        let registry = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut interval = ticker(period);
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.sweep();
            }
        });
        self.sweeper.replace(handle);
        info!(interval_ms = period.as_millis() as u64, "Presence sweep started");
    }

    /// Stop the periodic sweep.
    pub fn stop(&self) {
        self.sweeper.abort();
    }

    /// Whether the sweep task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.sweeper.is_running()
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PresenceRegistry {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}
