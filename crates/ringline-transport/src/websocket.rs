//! Standalone WebSocket listener built on tokio-tungstenite.
//!
//! For deployments without an HTTP router in front. Any request path is
//! upgraded.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use ringline_protocol::{Encoding, Frame};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_async_with_config,
    tungstenite::{protocol::WebSocketConfig as SocketLimits, Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, info};

use crate::framing::{FrameCodec, Outbound};
use crate::traits::{Connection, ConnectionId, Transport, TransportError};

/// Default maximum inbound message size (64 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default time a client gets to finish the HTTP upgrade.
pub const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub bind_addr: SocketAddr,
    /// Larger messages are refused by the WebSocket layer.
    pub max_message_size: usize,
    pub upgrade_timeout: Duration,
}

impl WebSocketConfig {
    /// Configuration for `bind_addr` with default limits.
    #[must_use]
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            upgrade_timeout: DEFAULT_UPGRADE_TIMEOUT,
        }
    }

    fn socket_limits(&self) -> SocketLimits {
        let mut limits = SocketLimits::default();
        limits.max_message_size = Some(self.max_message_size);
        limits.max_frame_size = Some(self.max_message_size);
        limits
    }
}

/// WebSocket transport.
pub struct WebSocketTransport {
    listener: TcpListener,
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("WebSocket transport listening on {}", config.bind_addr);
        Ok(Self { listener, config })
    }

    /// Bind with default limits.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(WebSocketConfig::new(addr)).await
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, addr) = self.listener.accept().await?;

        let upgrade = accept_async_with_config(stream, Some(self.config.socket_limits()));
        let ws_stream = match tokio::time::timeout(self.config.upgrade_timeout, upgrade).await {
            Ok(Ok(ws_stream)) => ws_stream,
            Ok(Err(e)) => return Err(TransportError::Upgrade(format!("{addr}: {e}"))),
            Err(_) => return Err(TransportError::Upgrade(format!("{addr}: timed out"))),
        };

        debug!("WebSocket upgrade completed with {}", addr);
        Ok(Box::new(WebSocketConnection::new(
            ws_stream,
            addr,
            self.config.max_message_size,
        )))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// A client accepted by [`WebSocketTransport`].
pub struct WebSocketConnection {
    id: ConnectionId,
    stream: WebSocketStream<TcpStream>,
    remote_addr: SocketAddr,
    is_open: bool,
    codec: FrameCodec,
}

impl WebSocketConnection {
    fn new(stream: WebSocketStream<TcpStream>, remote_addr: SocketAddr, max_message_size: usize) -> Self {
        Self {
            id: ConnectionId::generate(),
            stream,
            remote_addr,
            is_open: true,
            codec: FrameCodec::new(max_message_size),
        }
    }

    fn closed(&mut self) -> Result<Option<Frame>, TransportError> {
        debug!(connection = %self.id, "WebSocket closed by client");
        self.is_open = false;
        Ok(None)
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        // A binary message may have carried more than one frame.
        if let Some(frame) = self.codec.next_buffered()? {
            return Ok(Some(frame));
        }

        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    return self.closed();
                }
                Some(Err(e)) => {
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            };

            match message {
                Message::Binary(data) => {
                    if let Some(frame) = self.codec.feed_binary(&data)? {
                        return Ok(Some(frame));
                    }
                }
                Message::Text(text) => return Ok(Some(self.codec.feed_text(&text)?)),
                Message::Close(_) => return self.closed(),
                // tungstenite answers pings itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
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
        self.stream
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(());
        }
        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(e.to_string())),
        }
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.to_string())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }

    fn encoding(&self) -> Encoding {
        self.codec.encoding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringline_protocol::codec;

    async fn listener() -> (WebSocketTransport, String) {
        let transport = WebSocketTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let url = format!("ws://{}", transport.local_addr().unwrap());
        (transport, url)
    }

    #[tokio::test]
    async fn test_json_client_round_trip() {
        let (transport, url) = listener().await;

        let client = tokio::spawn(async move {
            let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
            ws.send(Message::Text(r#"{"type":"ping","timestamp":7}"#.into()))
                .await
                .unwrap();
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => codec::decode_json(&text).unwrap(),
                other => panic!("Expected text reply, got {:?}", other),
            }
        });

        let mut conn = transport.accept().await.unwrap();
        let frame = conn.recv().await.unwrap().unwrap();
        assert_eq!(frame, Frame::Ping { timestamp: Some(7) });
        assert_eq!(conn.encoding(), Encoding::Json);

        conn.send(Frame::pong(Some(7))).await.unwrap();
        assert_eq!(client.await.unwrap(), Frame::pong(Some(7)));
    }

    #[tokio::test]
    async fn test_binary_client_gets_binary_replies() {
        let (transport, url) = listener().await;

        let client = tokio::spawn(async move {
            let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
            let data = codec::encode(&Frame::ping()).unwrap();
            ws.send(Message::Binary(data.to_vec())).await.unwrap();
            match ws.next().await.unwrap().unwrap() {
                Message::Binary(data) => codec::decode(&data).unwrap(),
                other => panic!("Expected binary reply, got {:?}", other),
            }
        });

        let mut conn = transport.accept().await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), Some(Frame::ping()));
        conn.send(Frame::pong(None)).await.unwrap();
        assert_eq!(client.await.unwrap(), Frame::pong(None));

        conn.close().await.unwrap();
        assert!(!conn.is_open());
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_plain_tcp_client_fails_upgrade() {
        let mut config = WebSocketConfig::new("127.0.0.1:0".parse().unwrap());
        config.upgrade_timeout = Duration::from_millis(100);
        let transport = WebSocketTransport::new(config).await.unwrap();
        let addr = transport.local_addr().unwrap();

        // Connects but never sends an HTTP request.
        let _idle = TcpStream::connect(addr).await.unwrap();

        match transport.accept().await {
            Err(TransportError::Upgrade(reason)) => assert!(reason.contains("timed out")),
            Err(e) => panic!("Expected upgrade timeout, got {e}"),
            Ok(_) => panic!("Expected upgrade timeout, got a connection"),
        }
    }
}
