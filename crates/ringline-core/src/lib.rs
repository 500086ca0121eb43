//! # ringline-core
//!
//! Presence, rate limiting, call sessions and signaling relay for the
//! Ringline call signaling server.
//!
//! This crate provides the services behind every connection:
//!
//! - **Presence** - Which identities are reachable, and through which connection
//! - **RateLimiter** - Sliding-window limits per identity and per call
//! - **CallStore** - Call sessions and their state machine
//! - **SignalingRouter** - Validates, relays and commits signaling messages
//! - **ConnectionAdapter** - Handshake and frame dispatch for transports
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Adapter   │────▶│   Router    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                                          │    │    │
//!                      ┌───────────────────┘    │    └──────────┐
//!                      ▼                        ▼               ▼
//!               ┌─────────────┐         ┌─────────────┐  ┌─────────────┐
//!               │  Presence   │         │ RateLimiter │  │  CallStore  │
//!               └─────────────┘         └─────────────┘  └─────────────┘
//! ```
//!
//! Services are plain values with explicit `start`/`stop` lifecycles; the
//! server wires them together at startup.

pub mod adapter;
pub mod audit;
pub mod call;
pub mod connection;
pub mod error;
pub mod identity;
pub mod presence;
pub mod rate_limit;
pub mod router;
pub mod store;
mod task;

pub use adapter::{ConnectionAdapter, IdentityVerifier, TrustedTokenVerifier};
pub use audit::{AuditSink, ChannelAuditSink, MemoryAuditSink, TracingAuditSink};
pub use call::{CallId, CallSession, CallSnapshot, CallState, EndReason, Role, TransitionRecord};
pub use connection::{ConnectionHandle, DeliveryFailed};
pub use error::SignalError;
pub use identity::Identity;
pub use presence::{
    OfflineReason, PresenceConfig, PresenceEntry, PresenceEvent, PresenceRegistry, PresenceStatus,
};
pub use rate_limit::{ActionClass, RateLimitConfig, RateLimiter, RateRule, Subject};
pub use router::{Ack, RouterConfig, RouterStats, SignalingRouter};
pub use store::{CallConfig, CallGuard, CallStore, StoreStats, Termination};
