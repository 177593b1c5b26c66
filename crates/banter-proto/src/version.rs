//! Protocol versioning.
//!
//! Clients announce their protocol version in the `hi` handshake;
//! the server rejects incompatible majors.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 0, minor: 22 };

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u16,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u16,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Check if this version is compatible with another version.
    ///
    /// Versions are compatible if they share the same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

impl FromStr for Version {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, '.');
        let major = parts
            .next()
            .and_then(|p| p.trim().parse().ok())
            .ok_or("missing major version")?;
        let minor = parts.next().and_then(|p| p.trim().parse().ok()).unwrap_or(0);
        Ok(Self { major, minor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        let v0_20 = Version::new(0, 20);
        let v0_22 = Version::new(0, 22);
        let v1_0 = Version::new(1, 0);

        assert!(v0_20.is_compatible_with(&v0_22));
        assert!(v0_22.is_compatible_with(&v0_20));
        assert!(!v0_22.is_compatible_with(&v1_0));
    }

    #[test]
    fn test_version_parse() {
        assert_eq!("0.22".parse::<Version>(), Ok(Version::new(0, 22)));
        assert_eq!("1".parse::<Version>(), Ok(Version::new(1, 0)));
        assert!("x.y".parse::<Version>().is_err());
    }

    #[test]
    fn test_version_display() {
        assert_eq!(Version::new(0, 22).to_string(), "0.22");
    }
}
