//! Frame types for the Ringline protocol.
//!
//! Frames are the unit of communication between clients and the server.
//! Every frame is an object tagged by its `type` field, so the same shape
//! travels as MessagePack (binary) or JSON (text).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Frame type identifiers, used for logging and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Connect,
    Connected,
    CallInitiate,
    Offer,
    Answer,
    Candidate,
    Decline,
    Hangup,
    Heartbeat,
    CallInfo,
    CallState,
    CallEnded,
    Presence,
    PeerReconnected,
    Superseded,
    Ack,
    Error,
    Ping,
    Pong,
}

impl FrameType {
    /// Wire name of the frame type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Connect => "connect",
            FrameType::Connected => "connected",
            FrameType::CallInitiate => "call-initiate",
            FrameType::Offer => "offer",
            FrameType::Answer => "answer",
            FrameType::Candidate => "candidate",
            FrameType::Decline => "decline",
            FrameType::Hangup => "hangup",
            FrameType::Heartbeat => "heartbeat",
            FrameType::CallInfo => "call-info",
            FrameType::CallState => "call-state",
            FrameType::CallEnded => "call-ended",
            FrameType::Presence => "presence",
            FrameType::PeerReconnected => "peer-reconnected",
            FrameType::Superseded => "superseded",
            FrameType::Ack => "ack",
            FrameType::Error => "error",
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The signaling message types a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Start a call towards `target`.
    CallInitiate,
    /// Session description offer.
    Offer,
    /// Session description answer; accepts a ringing call.
    Answer,
    /// Connectivity candidate.
    Candidate,
    /// Callee rejects a ringing call.
    Decline,
    /// Either party terminates the call.
    Hangup,
    /// Presence keepalive.
    Heartbeat,
}

impl SignalKind {
    /// Wire name of the signal.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::CallInitiate => "call-initiate",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::Decline => "decline",
            SignalKind::Hangup => "hangup",
            SignalKind::Heartbeat => "heartbeat",
        }
    }

    /// Whether the signal must reference an existing call.
    #[must_use]
    pub fn requires_call_id(&self) -> bool {
        !matches!(self, SignalKind::CallInitiate | SignalKind::Heartbeat)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body shared by all signaling frames.
///
/// `payload` is opaque to the server: session descriptions, candidates and
/// control data are forwarded untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalBody {
    /// Optional request ID for acknowledgment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Call the signal refers to. Assigned by the server for `call-initiate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Callee identity (`call-initiate` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Sender identity, stamped by the server on relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Opaque signaling payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl SignalBody {
    /// Create a body for an existing call.
    #[must_use]
    pub fn for_call(call_id: impl Into<String>, payload: Value) -> Self {
        Self {
            call_id: Some(call_id.into()),
            payload,
            ..Default::default()
        }
    }

    /// Create a `call-initiate` body.
    #[must_use]
    pub fn initiate(target: impl Into<String>, payload: Value) -> Self {
        Self {
            target: Some(target.into()),
            payload,
            ..Default::default()
        }
    }

    /// Attach a request ID.
    #[must_use]
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }
}

/// Presence status as seen by other clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Online,
    Away,
    Offline,
}

/// Snapshot of a call returned for a `call-info` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStateBody {
    /// ID of the `call-info` request.
    pub id: u64,
    pub call_id: String,
    pub caller: String,
    pub callee: String,
    /// Current state name (`ringing`, `connected`, ...).
    pub state: String,
    /// Terminal reason, if the call is over.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initial connection handshake.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol major version.
        version: u8,
        /// Verified identity token from the authentication collaborator.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Handshake accepted.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Identity bound to this connection.
        identity: String,
        /// Negotiated protocol major version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    #[serde(rename = "call-initiate")]
    CallInitiate(SignalBody),

    #[serde(rename = "offer")]
    Offer(SignalBody),

    #[serde(rename = "answer")]
    Answer(SignalBody),

    #[serde(rename = "candidate")]
    Candidate(SignalBody),

    #[serde(rename = "decline")]
    Decline(SignalBody),

    #[serde(rename = "hangup")]
    Hangup(SignalBody),

    #[serde(rename = "heartbeat")]
    Heartbeat(SignalBody),

    /// Ask for the current state of a call.
    #[serde(rename = "call-info")]
    CallInfo {
        /// Request ID.
        id: u64,
        call_id: String,
    },

    /// Response to `call-info`, or an unsolicited snapshot (`id` 0) of a
    /// live call sent to a client that reconnected.
    #[serde(rename = "call-state")]
    CallState(CallStateBody),

    /// A call ended for a reason other than a relayed signal.
    #[serde(rename = "call-ended")]
    CallEnded { call_id: String, reason: String },

    /// Presence change of another identity.
    #[serde(rename = "presence")]
    Presence { identity: String, status: PeerStatus },

    /// The other participant of a live call is back on a new connection.
    #[serde(rename = "peer-reconnected")]
    PeerReconnected { call_id: String, identity: String },

    /// This connection was replaced by a newer one for the same identity.
    #[serde(rename = "superseded")]
    Superseded {
        /// ID of the replacing connection.
        connection_id: String,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request (0 if the request carried none).
        id: u64,
        /// Call the acknowledgment refers to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`crate::ErrorCode`].
        code: u16,
        /// Human-readable error message.
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::CallInitiate(_) => FrameType::CallInitiate,
            Frame::Offer(_) => FrameType::Offer,
            Frame::Answer(_) => FrameType::Answer,
            Frame::Candidate(_) => FrameType::Candidate,
            Frame::Decline(_) => FrameType::Decline,
            Frame::Hangup(_) => FrameType::Hangup,
            Frame::Heartbeat(_) => FrameType::Heartbeat,
            Frame::CallInfo { .. } => FrameType::CallInfo,
            Frame::CallState(_) => FrameType::CallState,
            Frame::CallEnded { .. } => FrameType::CallEnded,
            Frame::Presence { .. } => FrameType::Presence,
            Frame::PeerReconnected { .. } => FrameType::PeerReconnected,
            Frame::Superseded { .. } => FrameType::Superseded,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Split a signaling frame into its kind and body.
    #[must_use]
    pub fn signal(&self) -> Option<(SignalKind, &SignalBody)> {
        let kind = match self {
            Frame::CallInitiate(_) => SignalKind::CallInitiate,
            Frame::Offer(_) => SignalKind::Offer,
            Frame::Answer(_) => SignalKind::Answer,
            Frame::Candidate(_) => SignalKind::Candidate,
            Frame::Decline(_) => SignalKind::Decline,
            Frame::Hangup(_) => SignalKind::Hangup,
            Frame::Heartbeat(_) => SignalKind::Heartbeat,
            _ => return None,
        };
        match self {
            Frame::CallInitiate(b)
            | Frame::Offer(b)
            | Frame::Answer(b)
            | Frame::Candidate(b)
            | Frame::Decline(b)
            | Frame::Hangup(b)
            | Frame::Heartbeat(b) => Some((kind, b)),
            _ => None,
        }
    }

    /// Build a signaling frame from its kind and body.
    #[must_use]
    pub fn from_signal(kind: SignalKind, body: SignalBody) -> Self {
        match kind {
            SignalKind::CallInitiate => Frame::CallInitiate(body),
            SignalKind::Offer => Frame::Offer(body),
            SignalKind::Answer => Frame::Answer(body),
            SignalKind::Candidate => Frame::Candidate(body),
            SignalKind::Decline => Frame::Decline(body),
            SignalKind::Hangup => Frame::Hangup(body),
            SignalKind::Heartbeat => Frame::Heartbeat(body),
        }
    }

    /// Take a signaling frame apart, handing back any other frame unchanged.
    ///
    /// # Errors
    ///
    /// Returns the frame itself when it is not a signaling frame.
    pub fn into_signal(self) -> Result<(SignalKind, SignalBody), Frame> {
        match self {
            Frame::CallInitiate(b) => Ok((SignalKind::CallInitiate, b)),
            Frame::Offer(b) => Ok((SignalKind::Offer, b)),
            Frame::Answer(b) => Ok((SignalKind::Answer, b)),
            Frame::Candidate(b) => Ok((SignalKind::Candidate, b)),
            Frame::Decline(b) => Ok((SignalKind::Decline, b)),
            Frame::Hangup(b) => Ok((SignalKind::Hangup, b)),
            Frame::Heartbeat(b) => Ok((SignalKind::Heartbeat, b)),
            other => Err(other),
        }
    }

    /// Request ID to echo in a reply, 0 when the frame carries none.
    #[must_use]
    pub fn request_id(&self) -> u64 {
        match self {
            Frame::CallInfo { id, .. } => *id,
            _ => self.signal().and_then(|(_, b)| b.id).unwrap_or(0),
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, token: Option<String>) -> Self {
        Frame::Connect { version, token }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        identity: impl Into<String>,
        version: u8,
        heartbeat: u32,
    ) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            identity: identity.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64, call_id: Option<String>) -> Self {
        Frame::Ack { id, call_id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
            call_id: None,
        }
    }

    /// Create a new CallEnded frame.
    #[must_use]
    pub fn call_ended(call_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Frame::CallEnded {
            call_id: call_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a new Presence frame.
    #[must_use]
    pub fn presence(identity: impl Into<String>, status: PeerStatus) -> Self {
        Frame::Presence {
            identity: identity.into(),
            status,
        }
    }

    /// Create a new PeerReconnected frame.
    #[must_use]
    pub fn peer_reconnected(call_id: impl Into<String>, identity: impl Into<String>) -> Self {
        Frame::PeerReconnected {
            call_id: call_id.into(),
            identity: identity.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}
