//! # ringline-transport
//!
//! Transport abstraction layer for the Ringline signaling server.
//!
//! This crate provides a unified interface for different transports:
//!
//! - **WebSocket** - Standalone tokio-tungstenite listener
//! - **Axum** - WebSockets upgraded by an axum route
//! - **Memory** - In-process channel pairs for embedding and tests
//!
//! ## Transport Abstraction
//!
//! All transports implement the `Transport` and `Connection` traits,
//! allowing the server to be protocol-agnostic. WebSocket connections
//! accept both binary (MessagePack) and text (JSON) messages and answer
//! in whichever encoding the client used last.
//!
//! ```rust,ignore
//! use ringline_transport::{Transport, Connection};
//!
//! async fn handle_connection(mut conn: Box<dyn Connection>) {
//!     while let Ok(Some(frame)) = conn.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod framing;
pub mod memory;
pub mod traits;

#[cfg(feature = "axum")]
pub mod axum_ws;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryClient, MemoryConnection, MemoryTransport};
pub use traits::{Connection, ConnectionId, Transport, TransportError};

#[cfg(feature = "axum")]
pub use axum_ws::AxumConnection;

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};
