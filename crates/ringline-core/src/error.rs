//! Error taxonomy shared by every signaling component.
//!
//! Every variant is a local, recoverable condition. The connection adapter
//! turns them into `error` frames for the originating client.

use crate::call::CallId;
use crate::identity::Identity;
use crate::rate_limit::ActionClass;
use ringline_protocol::{ErrorCode, Frame};
use thiserror::Error;

/// Rejection reasons returned by the registry, store and router.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SignalError {
    /// Identity is malformed or empty.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Heartbeat or lookup on an absent entity.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Action threshold exceeded for the subject.
    #[error("Rate limited: too many {action} actions for {subject}")]
    RateLimited {
        subject: String,
        action: ActionClass,
    },

    /// Message is not valid in the call's current state.
    #[error("Invalid state: {message}")]
    InvalidState {
        call_id: Option<CallId>,
        message: String,
    },

    /// Destination has no live connection or delivery failed.
    #[error("Peer unreachable: {identity}")]
    UnreachablePeer {
        call_id: Option<CallId>,
        identity: Identity,
    },

    /// Message lacks a field the signal requires.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Handshake did not produce a verified identity.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SignalError {
    pub(crate) fn invalid_state(call_id: Option<&CallId>, message: impl Into<String>) -> Self {
        SignalError::InvalidState {
            call_id: call_id.cloned(),
            message: message.into(),
        }
    }

    /// Wire error code for this rejection.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            SignalError::Conflict(_) => ErrorCode::Conflict,
            SignalError::NotFound(_) => ErrorCode::NotFound,
            SignalError::RateLimited { .. } => ErrorCode::RateLimited,
            SignalError::InvalidState { .. } => ErrorCode::InvalidState,
            SignalError::UnreachablePeer { .. } => ErrorCode::UnreachablePeer,
            SignalError::Malformed(_) => ErrorCode::Malformed,
            SignalError::Unauthenticated(_) => ErrorCode::Handshake,
            SignalError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Call the rejection refers to, if any.
    #[must_use]
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            SignalError::InvalidState { call_id, .. }
            | SignalError::UnreachablePeer { call_id, .. } => call_id.as_ref(),
            _ => None,
        }
    }

    /// Build the `error` frame answering request `request_id`.
    #[must_use]
    pub fn to_frame(&self, request_id: u64) -> Frame {
        Frame::Error {
            id: request_id,
            code: self.code().as_u16(),
            message: self.to_string(),
            call_id: self.call_id().map(|id| id.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_frame_carries_call_id() {
        let call_id = CallId::from("call_1");
        let err = SignalError::invalid_state(Some(&call_id), "call is ended");

        match err.to_frame(12) {
            Frame::Error {
                id,
                code,
                call_id,
                message,
            } => {
                assert_eq!(id, 12);
                assert_eq!(code, 1005);
                assert_eq!(call_id.as_deref(), Some("call_1"));
                assert!(message.contains("call is ended"));
            }
            other => panic!("Expected error frame, got {:?}", other),
        }
    }

    #[test]
    fn test_rate_limited_message() {
        let err = SignalError::RateLimited {
            subject: "alice".into(),
            action: ActionClass::CallInitiate,
        };
        assert_eq!(err.code(), ErrorCode::RateLimited);
        assert_eq!(
            err.to_string(),
            "Rate limited: too many call-initiate actions for alice"
        );
    }
}
