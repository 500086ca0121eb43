//! Call sessions and their state machine.

use crate::error::SignalError;
use crate::identity::Identity;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

static CALL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Milliseconds since the Unix epoch.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Unique, opaque call identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Generate a fresh call ID.
    ///
    /// IDs read `call_<hex millis>_<hex sequence>`. The sequence is a
    /// process-wide 64-bit counter, so one process never hands out the same
    /// ID twice.
    #[must_use]
    pub fn generate() -> Self {
        let seq = CALL_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("call_{:x}_{:x}", unix_millis(), seq))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CallId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CallId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Initiating,
    Ringing,
    Connected,
    Ended,
    Failed,
}

impl CallState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Initiating => "initiating",
            CallState::Ringing => "ringing",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
            CallState::Failed => "failed",
        }
    }

    /// `ended` and `failed` are absorbing.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }

    /// Whether the state machine has an edge from `self` to `to`.
    #[must_use]
    pub fn can_transition_to(&self, to: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, to),
            (Initiating, Ringing)
                | (Initiating, Failed)
                | (Initiating, Ended)
                | (Ringing, Connected)
                | (Ringing, Ended)
                | (Connected, Ended)
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Declined,
    Hangup,
    PeerUnreachable,
    Timeout,
    CalleeUnreachable,
}

impl EndReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Declined => "declined",
            EndReason::Hangup => "hangup",
            EndReason::PeerUnreachable => "peer_unreachable",
            EndReason::Timeout => "timeout",
            EndReason::CalleeUnreachable => "callee_unreachable",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a call an identity is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// One entry of a session's transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub call_id: CallId,
    /// `None` for the creation record.
    pub from_state: Option<CallState>,
    pub to_state: CallState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<EndReason>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// A call between two identities.
#[derive(Debug, Clone)]
pub struct CallSession {
    id: CallId,
    caller: Identity,
    callee: Identity,
    state: CallState,
    reason: Option<EndReason>,
    created_at: u64,
    last_activity: Instant,
    history: Vec<TransitionRecord>,
}

impl CallSession {
    pub(crate) fn new(id: CallId, caller: Identity, callee: Identity) -> Self {
        let created_at = unix_millis();
        let record = TransitionRecord {
            call_id: id.clone(),
            from_state: None,
            to_state: CallState::Initiating,
            reason: None,
            timestamp: created_at,
        };
        Self {
            id,
            caller,
            callee,
            state: CallState::Initiating,
            reason: None,
            created_at,
            last_activity: Instant::now(),
            history: vec![record],
        }
    }

    #[must_use]
    pub fn id(&self) -> &CallId {
        &self.id
    }

    #[must_use]
    pub fn caller(&self) -> &Identity {
        &self.caller
    }

    #[must_use]
    pub fn callee(&self) -> &Identity {
        &self.callee
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Terminal reason, set once the call is over.
    #[must_use]
    pub fn reason(&self) -> Option<EndReason> {
        self.reason
    }

    /// Creation time in milliseconds since the Unix epoch.
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Every transition so far, creation first.
    #[must_use]
    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    #[must_use]
    pub fn role_of(&self, identity: &Identity) -> Option<Role> {
        if *identity == self.caller {
            Some(Role::Caller)
        } else if *identity == self.callee {
            Some(Role::Callee)
        } else {
            None
        }
    }

    #[must_use]
    pub fn is_participant(&self, identity: &Identity) -> bool {
        self.role_of(identity).is_some()
    }

    /// The other participant.
    #[must_use]
    pub fn peer_of(&self, identity: &Identity) -> Option<&Identity> {
        match self.role_of(identity)? {
            Role::Caller => Some(&self.callee),
            Role::Callee => Some(&self.caller),
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Apply a transition and append it to the history.
    pub(crate) fn transition(
        &mut self,
        to: CallState,
        reason: Option<EndReason>,
    ) -> Result<TransitionRecord, SignalError> {
        if !self.state.can_transition_to(to) {
            return Err(SignalError::invalid_state(
                Some(&self.id),
                format!("call {} cannot go from {} to {}", self.id, self.state, to),
            ));
        }

        let record = TransitionRecord {
            call_id: self.id.clone(),
            from_state: Some(self.state),
            to_state: to,
            reason,
            timestamp: unix_millis(),
        };
        self.state = to;
        if to.is_terminal() {
            self.reason = reason;
        }
        self.touch();
        self.history.push(record.clone());
        Ok(record)
    }

    /// Read-only copy for queries.
    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.id.clone(),
            caller: self.caller.clone(),
            callee: self.callee.clone(),
            state: self.state,
            reason: self.reason,
            created_at: self.created_at,
        }
    }
}

/// Point-in-time view of a call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub call_id: CallId,
    pub caller: Identity,
    pub callee: Identity,
    pub state: CallState,
    pub reason: Option<EndReason>,
    pub created_at: u64,
}

impl CallSnapshot {
    /// Build the `call-state` reply for request `request_id`.
    #[must_use]
    pub fn to_frame(&self, request_id: u64) -> ringline_protocol::Frame {
        ringline_protocol::Frame::CallState(ringline_protocol::CallStateBody {
            id: request_id,
            call_id: self.call_id.to_string(),
            caller: self.caller.to_string(),
            callee: self.callee.to_string(),
            state: self.state.to_string(),
            reason: self.reason.map(|r| r.to_string()),
            created_at: self.created_at,
        })
    }
}
