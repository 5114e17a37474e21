//! Protocol versioning for safe upgrades.
//!
//! The daemon stamps every HTTP response with [`PROTOCOL_HEADER`]. Clients
//! may send the same header; a request announcing a different major
//! version is rejected before it reaches a handler.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Header carrying the protocol version on requests and responses.
pub const PROTOCOL_HEADER: &str = "x-clibridge-protocol";

/// Protocol version for client-daemon communication.
///
/// Uses semantic versioning: major.minor
/// - Major version bump: breaking changes, incompatible
/// - Minor version bump: additive changes, backward compatible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Current protocol version.
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    /// Creates a new ProtocolVersion.
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Parses a version string like "1.0".
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let (major, minor) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| VersionError::InvalidFormat(s.to_string()))?;

        let major = major
            .parse::<u16>()
            .map_err(|_| VersionError::InvalidFormat(s.to_string()))?;
        let minor = minor
            .parse::<u16>()
            .map_err(|_| VersionError::InvalidFormat(s.to_string()))?;

        Ok(Self { major, minor })
    }

    /// Returns true if this version is compatible with another.
    ///
    /// Compatibility rules:
    /// - Major versions must match
    /// - Any minor version is compatible within the same major version
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }

    /// Returns true if this version is newer than another.
    pub fn is_newer_than(&self, other: &ProtocolVersion) -> bool {
        (self.major, self.minor) > (other.major, other.minor)
    }

    /// Checks a client-announced version string against [`Self::CURRENT`].
    ///
    /// # Errors
    ///
    /// - `VersionError::InvalidFormat` if the string is not `major.minor`
    /// - `VersionError::Incompatible` if the major version differs
    pub fn negotiate(announced: &str) -> Result<Self, VersionError> {
        let version = Self::parse(announced)?;
        if !version.is_compatible_with(&Self::CURRENT) {
            return Err(VersionError::Incompatible {
                got: version.to_string(),
                expected: Self::CURRENT.to_string(),
            });
        }
        Ok(version)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Errors that can occur with version handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Invalid version format: {0}")]
    InvalidFormat(String),

    #[error("Incompatible version: got {got}, expected {expected}")]
    Incompatible { got: String, expected: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse() {
        let v = ProtocolVersion::parse("1.0").unwrap();
        assert_eq!(v.major, 1);
        assert_eq!(v.minor, 0);
    }

    #[test]
    fn test_version_parse_invalid() {
        assert!(ProtocolVersion::parse("1").is_err());
        assert!(ProtocolVersion::parse("1.0.0").is_err());
        assert!(ProtocolVersion::parse("abc").is_err());
    }

    #[test]
    fn test_version_compatibility() {
        let v1_0 = ProtocolVersion::new(1, 0);
        let v1_1 = ProtocolVersion::new(1, 1);
        let v2_0 = ProtocolVersion::new(2, 0);

        assert!(v1_0.is_compatible_with(&v1_1));
        assert!(v1_1.is_compatible_with(&v1_0));
        assert!(!v1_0.is_compatible_with(&v2_0));
        assert!(v2_0.is_newer_than(&v1_1));
    }

    #[test]
    fn test_negotiate() {
        assert_eq!(
            ProtocolVersion::negotiate("1.7").unwrap(),
            ProtocolVersion::new(1, 7)
        );
        assert!(matches!(
            ProtocolVersion::negotiate("2.0"),
            Err(VersionError::Incompatible { .. })
        ));
        assert!(matches!(
            ProtocolVersion::negotiate("v1"),
            Err(VersionError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_version_display() {
        let v = ProtocolVersion::new(1, 2);
        assert_eq!(format!("{v}"), "1.2");
    }
}
