//! Protocol versioning.
//!
//! The serializer version is sent as the `vsn` query parameter on every
//! connection URL.

use std::fmt;
use std::str::FromStr;

/// Current serializer version.
pub const PROTOCOL_VERSION: Version = Version {
    major: 2,
    minor: 0,
    patch: 0,
};

/// Name of the query parameter carrying the version.
pub const VSN_PARAM: &str = "vsn";

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
    /// Patch version.
    pub patch: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Check if this version is compatible with another version.
    ///
    /// Versions are compatible if they share the same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.').map(str::parse::<u8>);
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(Ok(major)), Some(Ok(minor)), Some(Ok(patch)), None) => {
                Ok(Self::new(major, minor, patch))
            }
            _ => Err("Invalid version"),
        }
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        let v2_0 = Version::new(2, 0, 0);
        let v2_1 = Version::new(2, 1, 0);
        let v1_0 = Version::new(1, 0, 0);

        assert!(v2_0.is_compatible_with(&v2_1));
        assert!(!v2_0.is_compatible_with(&v1_0));
    }

    #[test]
    fn test_version_display() {
        assert_eq!(PROTOCOL_VERSION.to_string(), "2.0.0");
    }

    #[test]
    fn test_version_parse() {
        assert_eq!("2.0.0".parse::<Version>(), Ok(PROTOCOL_VERSION));
        assert!("2.0".parse::<Version>().is_err());
        assert!("2.x.0".parse::<Version>().is_err());
    }
}
