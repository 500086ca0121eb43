//! The seam between socket handling and signaling.
//!
//! A [`Transport`] hands out [`Connection`]s; a connection moves decoded
//! [`Frame`]s in both directions. Nothing above this layer knows whether a
//! client arrived over axum, a bare tungstenite listener or an in-process
//! channel.

use async_trait::async_trait;
use ringline_protocol::{Encoding, Frame, ProtocolError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(0);

/// Process-unique connection identifier, reported to the client in its
/// `connected` frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Mint an ID from the clock and a process-wide sequence number.
    #[must_use]
    pub fn generate() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_micros());
        let seq = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{micros:x}_{seq:x}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer or the listener is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The WebSocket upgrade did not complete.
    #[error("WebSocket upgrade failed: {0}")]
    Upgrade(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// The peer sent bytes that are not a frame.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the connection survives this error.
    ///
    /// Only decoding failures qualify; the offending message is dropped
    /// and the next one can be read.
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(self, TransportError::Protocol(_))
    }
}

/// Source of new client connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait for the next client.
    ///
    /// Errors other than [`TransportError::ConnectionClosed`] concern a
    /// single client; the transport keeps accepting.
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Short name for logs and metrics.
    fn name(&self) -> &'static str;
}

/// One client, as a bidirectional stream of frames.
///
/// Driven by a single task, so it is `Send` but need not be `Sync`.
#[async_trait]
pub trait Connection: Send {
    fn id(&self) -> &ConnectionId;

    /// Next frame from the client, or `None` once it closed cleanly.
    ///
    /// Must be cancel safe: the driver polls it inside `select!`.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;

    /// Send a frame, encoded the way the client last spoke.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Say goodbye. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// Encoding used for outbound frames.
    fn encoding(&self) -> Encoding;

    /// Peer address, where the transport has one.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}
