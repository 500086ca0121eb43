//! Verified identities.
//!
//! Identities come from the authentication collaborator; this crate only
//! checks that they are well-formed before binding them to a connection.

use crate::error::SignalError;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Maximum identity length in bytes.
pub const MAX_IDENTITY_LENGTH: usize = 256;

/// Validate an identity string.
///
/// # Errors
///
/// Returns an error message if the identity is invalid.
pub fn validate_identity(identity: &str) -> Result<(), &'static str> {
    if identity.is_empty() {
        return Err("Identity cannot be empty");
    }
    if identity.len() > MAX_IDENTITY_LENGTH {
        return Err("Identity too long");
    }
    if !identity.chars().all(|c| c.is_ascii_graphic()) {
        return Err("Identity contains invalid characters");
    }
    Ok(())
}

/// An opaque, externally verified identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Parse and validate an identity.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Conflict`] when the identity is malformed.
    pub fn parse(identity: impl Into<String>) -> Result<Self, SignalError> {
        let identity = identity.into();
        validate_identity(&identity)
            .map_err(|reason| SignalError::Conflict(format!("{reason}: {identity:?}")))?;
        Ok(Self(identity))
    }

    /// Get the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Identity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_validation() {
        assert!(validate_identity("alice@example.com").is_ok());
        assert!(validate_identity("").is_err());
        assert!(validate_identity("has space").is_err());
        assert!(validate_identity("tab\there").is_err());
        assert!(validate_identity("ünïcode").is_err());

        let long = "a".repeat(MAX_IDENTITY_LENGTH + 1);
        assert!(validate_identity(&long).is_err());
    }

    #[test]
    fn test_parse_maps_to_conflict() {
        assert_eq!(Identity::parse("bob").unwrap().as_str(), "bob");
        assert!(matches!(Identity::parse(""), Err(SignalError::Conflict(_))));
    }
}
