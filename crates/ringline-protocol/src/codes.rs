//! Error codes carried in `error` frames.

/// Numeric error codes sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// Frame could not be decoded or misses required fields.
    Malformed = 1001,
    /// Identity is malformed or empty.
    Conflict = 1002,
    /// Referenced entity does not exist.
    NotFound = 1003,
    /// Action rate exceeded.
    RateLimited = 1004,
    /// Message not valid in the call's current state.
    InvalidState = 1005,
    /// Destination has no live connection or delivery failed.
    UnreachablePeer = 1006,
    /// Handshake missing, rejected, or version mismatch.
    Handshake = 1007,
    /// Server-side fault.
    Internal = 1008,
}

impl ErrorCode {
    /// Numeric value on the wire.
    #[must_use]
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Short label, used for metrics.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            ErrorCode::Malformed => "malformed",
            ErrorCode::Conflict => "conflict",
            ErrorCode::NotFound => "not_found",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::InvalidState => "invalid_state",
            ErrorCode::UnreachablePeer => "unreachable_peer",
            ErrorCode::Handshake => "handshake",
            ErrorCode::Internal => "internal",
        }
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = &'static str;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1001 => Ok(ErrorCode::Malformed),
            1002 => Ok(ErrorCode::Conflict),
            1003 => Ok(ErrorCode::NotFound),
            1004 => Ok(ErrorCode::RateLimited),
            1005 => Ok(ErrorCode::InvalidState),
            1006 => Ok(ErrorCode::UnreachablePeer),
            1007 => Ok(ErrorCode::Handshake),
            1008 => Ok(ErrorCode::Internal),
            _ => Err("Invalid error code"),
        }
    }
}
