//! WebSocket connections upgraded by an axum handler.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use ringline_protocol::{Encoding, Frame};
use std::net::SocketAddr;
use tracing::debug;

use crate::framing::{FrameCodec, Outbound};
use crate::traits::{Connection, ConnectionId, TransportError};

/// A WebSocket accepted through an axum route.
pub struct AxumConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    is_open: bool,
    codec: FrameCodec,
}

impl AxumConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, remote_addr: Option<SocketAddr>, max_message_size: usize) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr,
            is_open: true,
            codec: FrameCodec::new(max_message_size),
        }
    }
}

#[async_trait]
impl Connection for AxumConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        if let Some(frame) = self.codec.next_buffered()? {
            return Ok(Some(frame));
        }

        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Binary(data))) => {
                    if let Some(frame) = self.codec.feed_binary(&data)? {
                        return Ok(Some(frame));
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(self.codec.feed_text(&text)?));
                }
                // axum answers pings itself
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    debug!(connection = %self.id, "WebSocket closed by client");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match self.codec.encode(&frame)? {
            Outbound::Binary(data) => Message::Binary(data.to_vec()),
            Outbound::Text(text) => Message::Text(text),
        };
        self.socket
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(());
        }
        self.socket
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }

    fn encoding(&self) -> Encoding {
        self.codec.encoding()
    }
}
