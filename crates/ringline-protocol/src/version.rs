//! Protocol versioning for Ringline.
//!
//! The handshake carries only the major version; minor revisions add
//! optional fields and never break older clients.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::ProtocolError;

/// Version spoken by this build.
pub const PROTOCOL_VERSION: Version = Version::new(1, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Bumped for incompatible frame changes.
    pub major: u8,
    pub minor: u8,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Pick the version for a client announcing `client_major` in its
    /// `connect` frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::VersionMismatch`] unless the client speaks
    /// our major version.
    pub fn negotiate(client_major: u8) -> Result<Version, ProtocolError> {
        if client_major == PROTOCOL_VERSION.major {
            Ok(PROTOCOL_VERSION)
        } else {
            Err(ProtocolError::VersionMismatch {
                client: client_major,
                server: PROTOCOL_VERSION.major,
            })
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate() {
        assert_eq!(Version::negotiate(1).unwrap(), PROTOCOL_VERSION);
        assert!(matches!(
            Version::negotiate(2),
            Err(ProtocolError::VersionMismatch { client: 2, server: 1 })
        ));
        assert!(Version::negotiate(0).is_err());
    }

    #[test]
    fn test_version_display() {
        assert_eq!(PROTOCOL_VERSION.to_string(), "1.0");
    }
}
