//! Protocol versioning for safe upgrades.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol version for client-authority communication.
///
/// Uses semantic versioning: major.minor
/// - Major version bump: breaking changes, incompatible
/// - Minor version bump: additive changes, backward compatible
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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
        let mut parts = s.split('.');

        let major = parts
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| VersionError::InvalidFormat(s.to_string()))?;

        let minor = parts
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| VersionError::InvalidFormat(s.to_string()))?;

        if parts.next().is_some() {
            return Err(VersionError::InvalidFormat(s.to_string()));
        }

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
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Errors from version parsing.
#[derive(Debug, Clone, Error)]
pub enum VersionError {
    #[error("invalid version format: {0} (expected major.minor)")]
    InvalidFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let v = ProtocolVersion::parse("1.2").unwrap();
        assert_eq!(v, ProtocolVersion::new(1, 2));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(ProtocolVersion::parse("1").is_err());
        assert!(ProtocolVersion::parse("1.2.3").is_err());
        assert!(ProtocolVersion::parse("a.b").is_err());
        assert!(ProtocolVersion::parse("").is_err());
    }

    #[test]
    fn test_compatibility() {
        let v1_0 = ProtocolVersion::new(1, 0);
        let v1_5 = ProtocolVersion::new(1, 5);
        let v2_0 = ProtocolVersion::new(2, 0);

        assert!(v1_0.is_compatible_with(&v1_5));
        assert!(v1_5.is_compatible_with(&v1_0));
        assert!(!v1_0.is_compatible_with(&v2_0));
    }

    #[test]
    fn test_ordering() {
        let v1_0 = ProtocolVersion::new(1, 0);
        let v1_1 = ProtocolVersion::new(1, 1);
        let v2_0 = ProtocolVersion::new(2, 0);

        assert!(v1_1.is_newer_than(&v1_0));
        assert!(v2_0.is_newer_than(&v1_1));
        assert!(!v1_0.is_newer_than(&v1_1));
    }

    #[test]
    fn test_display() {
        assert_eq!(ProtocolVersion::new(1, 4).to_string(), "1.4");
    }

    #[test]
    fn test_serde_roundtrip() {
        let v = ProtocolVersion::CURRENT;
        let json = serde_json::to_string(&v).unwrap();
        let parsed: ProtocolVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, v);
    }
}
