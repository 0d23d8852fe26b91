//! Server and schema version handling.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A `major.minor.patch` version as reported by a MySQL server or stored
/// in the metadata schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// Create a new version.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a server version string.
    ///
    /// Trailing build suffixes are ignored (`8.0.21-log`, `8.0.30-debug`),
    /// and missing components default to zero (`8.0` is `8.0.0`).
    pub fn parse(s: &str) -> Result<Self, VersionParseError> {
        let core = s
            .trim()
            .split(|c: char| c == '-' || c.is_whitespace())
            .next()
            .unwrap_or_default();

        if core.is_empty() {
            return Err(VersionParseError(s.to_string()));
        }

        let mut parts = [0u32; 3];
        let mut count = 0;
        for (i, component) in core.split('.').enumerate() {
            if i >= 3 {
                return Err(VersionParseError(s.to_string()));
            }
            parts[i] = component
                .parse()
                .map_err(|_| VersionParseError(s.to_string()))?;
            count += 1;
        }

        if count == 0 {
            return Err(VersionParseError(s.to_string()));
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }

    /// The version with the patch component dropped, e.g. for comparing
    /// against a `major.minor` upper bound.
    pub fn major_minor(&self) -> Self {
        Self::new(self.major, self.minor, 0)
    }

    /// Whether this is the all-zero version the metadata schema carries
    /// while a setup or upgrade is in progress.
    pub fn is_zero(&self) -> bool {
        self.major == 0 && self.minor == 0 && self.patch == 0
    }

    /// Version string without the patch component when it is zero.
    pub fn short(&self) -> String {
        if self.patch == 0 {
            format!("{}.{}", self.major, self.minor)
        } else {
            self.to_string()
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Error returned when a version string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid version string: '{0}'")]
pub struct VersionParseError(pub String);

/// Version limits of the administrative API.
pub mod limits {
    use super::Version;

    /// Lowest server version the AdminAPI supports.
    pub const MIN_ADMINAPI_SERVER_VERSION: Version = Version::new(5, 7, 0);

    /// First `major.minor` the AdminAPI does NOT support.
    pub const MAX_ADMINAPI_SERVER_VERSION: Version = Version::new(8, 1, 0);

    /// Lowest server version for Group Replication based operations.
    pub const MIN_GR_VERSION: Version = Version::new(5, 7, 0);

    /// Lowest server version for asynchronous ReplicaSet operations.
    pub const MIN_AR_VERSION: Version = Version::new(8, 0, 0);

    /// Lowest server version shipping the clone plugin.
    pub const MIN_CLONE_VERSION: Version = Version::new(8, 0, 17);

    /// Lowest server version supporting online primary mode changes.
    pub const MIN_PRIMARY_MODE_SWITCH_VERSION: Version = Version::new(8, 0, 13);

    /// Metadata schema version this build reads and writes.
    pub const CURRENT_METADATA_VERSION: Version = Version::new(2, 0, 0);

    /// Check whether a server version is inside the supported range.
    pub fn is_supported_server(version: Version) -> bool {
        version >= MIN_ADMINAPI_SERVER_VERSION
            && version.major_minor() < MAX_ADMINAPI_SERVER_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_version() {
        assert_eq!(Version::parse("8.0.21").unwrap(), Version::new(8, 0, 21));
    }

    #[test]
    fn test_parse_with_suffix() {
        assert_eq!(Version::parse("8.0.30-log").unwrap(), Version::new(8, 0, 30));
        assert_eq!(
            Version::parse("5.7.29-debug-log").unwrap(),
            Version::new(5, 7, 29)
        );
    }

    #[test]
    fn test_parse_short_version() {
        assert_eq!(Version::parse("8.0").unwrap(), Version::new(8, 0, 0));
        assert_eq!(Version::parse("8").unwrap(), Version::new(8, 0, 0));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("eight").is_err());
        assert!(Version::parse("8.0.1.2").is_err());
        assert!(Version::parse("8..1").is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(Version::new(8, 0, 17) > Version::new(8, 0, 16));
        assert!(Version::new(8, 1, 0) > Version::new(8, 0, 99));
        assert!(Version::new(5, 7, 30) < Version::new(8, 0, 0));
    }

    #[test]
    fn test_supported_range() {
        assert!(limits::is_supported_server(Version::new(5, 7, 0)));
        assert!(limits::is_supported_server(Version::new(8, 0, 35)));
        assert!(!limits::is_supported_server(Version::new(5, 6, 99)));
        assert!(!limits::is_supported_server(Version::new(8, 1, 0)));
    }

    #[test]
    fn test_short_display() {
        assert_eq!(Version::new(8, 0, 0).short(), "8.0");
        assert_eq!(Version::new(8, 0, 17).short(), "8.0.17");
    }
}
