//! In-process transport.
//!
//! Frames cross an mpsc channel pair without being encoded. Used for
//! embedding the server and for driving it in tests.

use async_trait::async_trait;
use ringline_protocol::{Encoding, Frame};
use tokio::sync::{mpsc, Mutex};

use crate::traits::{Connection, ConnectionId, Transport, TransportError};

/// Server side of an in-memory connection.
pub struct MemoryConnection {
    id: ConnectionId,
    inbound: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<Frame>,
    is_open: bool,
}

/// Client side of an in-memory connection.
pub struct MemoryClient {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryConnection {
    /// Create a connected server/client pair.
    #[must_use]
    pub fn pair() -> (Self, MemoryClient) {
        let (client_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, client_rx) = mpsc::unbounded_channel();
        let conn = Self {
            id: ConnectionId::generate(),
            inbound,
            outbound,
            is_open: true,
        };
        (
            conn,
            MemoryClient {
                tx: client_tx,
                rx: client_rx,
            },
        )
    }
}

impl MemoryClient {
    /// Send a frame to the server.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the server side is gone.
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.tx
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Receive the next frame from the server; `None` once it closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Receive a frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Hang up. The server sees a clean close.
    pub fn close(self) {}
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        if !self.is_open {
            return Ok(None);
        }
        let frame = self.inbound.recv().await;
        if frame.is_none() {
            self.is_open = false;
        }
        Ok(frame)
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.is_open = false;
        self.inbound.close();
        Ok(())
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".into())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }

    fn encoding(&self) -> Encoding {
        Encoding::MessagePack
    }
}

/// Transport whose connections are opened in-process.
pub struct MemoryTransport {
    pending_tx: mpsc::UnboundedSender<MemoryConnection>,
    pending_rx: Mutex<mpsc::UnboundedReceiver<MemoryConnection>>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        Self {
            pending_tx,
            pending_rx: Mutex::new(pending_rx),
        }
    }

    /// Open a connection; the server side is handed out by `accept`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the transport is gone.
    pub fn connect(&self) -> Result<MemoryClient, TransportError> {
        let (conn, client) = MemoryConnection::pair();
        self.pending_tx
            .send(conn)
            .map_err(|_| TransportError::ConnectionClosed)?;
        Ok(client)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let mut pending = self.pending_rx.lock().await;
        match pending.recv().await {
            Some(conn) => Ok(Box::new(conn)),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
