//! # ringline-protocol
//!
//! Wire protocol definitions for the Ringline call signaling server.
//!
//! ## Frame Types
//!
//! - `Connect` / `Connected` - Handshake binding a connection to an identity
//! - `CallInitiate`, `Offer`, `Answer`, `Candidate`, `Decline`, `Hangup` - Call signaling
//! - `Heartbeat` / `Ping` - Presence keepalive
//! - `CallEnded`, `Presence`, `Superseded` - Server notices
//! - `Ack` / `Error` - Acknowledgments and rejections
//!
//! ## Example
//!
//! ```rust
//! use ringline_protocol::{codec, Frame, SignalBody};
//!
//! let frame = Frame::Offer(SignalBody::for_call("call_1", serde_json::json!({"sdp": "v=0"})));
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod codes;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use codes::ErrorCode;
pub use frames::{CallStateBody, Frame, FrameType, PeerStatus, SignalBody, SignalKind};
pub use version::{Version, PROTOCOL_VERSION};
