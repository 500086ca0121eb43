//! Connection handles.
//!
//! A [`ConnectionHandle`] is the registry's reference to one live client
//! channel. Sending never blocks: frames go into the connection's outbox,
//! which the transport driver drains onto the socket.

use crate::identity::Identity;
use ringline_protocol::Frame;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// The connection is gone; the frame was not queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Delivery failed: connection {0} is closed")]
pub struct DeliveryFailed(pub String);

struct HandleInner {
    identity: Identity,
    connection_id: String,
    generation: u64,
    outbox: mpsc::UnboundedSender<Frame>,
    closed: watch::Sender<bool>,
}

/// Cheaply cloneable reference to a registered connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        identity: Identity,
        connection_id: String,
        generation: u64,
        outbox: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(HandleInner {
                identity,
                connection_id,
                generation,
                outbox,
                closed,
            }),
        }
    }

    /// Identity bound to this connection.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// Transport-level connection ID.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    /// Registration sequence number, unique per registry.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Queue a frame for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryFailed`] if the connection was closed or its
    /// driver has gone away.
    pub fn send(&self, frame: Frame) -> Result<(), DeliveryFailed> {
        if self.is_closed() {
            return Err(DeliveryFailed(self.inner.connection_id.clone()));
        }
        self.inner
            .outbox
            .send(frame)
            .map_err(|_| DeliveryFailed(self.inner.connection_id.clone()))
    }

    /// Mark the connection closed. The driver flushes queued frames and
    /// shuts the transport down.
    pub fn close(&self) {
        self.inner.closed.send_replace(true);
    }

    /// Whether the connection was closed or its driver dropped the outbox.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow() || self.inner.outbox.is_closed()
    }

    /// Wait until [`close`](Self::close) is called.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        // The sender lives in `self`, so this cannot observe a dropped channel.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Whether both handles refer to the same registration.
    #[must_use]
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("identity", &self.inner.identity)
            .field("connection_id", &self.inner.connection_id)
            .field("generation", &self.inner.generation)
            .field("closed", &self.is_closed())
            .finish()
    }
}
