//! macOS product version handling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A macOS product version as reported by `sw_vers -productVersion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl OsVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Check if the major version is at least `major`.
    pub fn is_at_least(&self, major: u32) -> bool {
        self.major >= major
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for OsVersion {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || crate::Error::InvalidVersion(s.to_string());
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(invalid());
        }

        let mut parts = [0u32; 3];
        for (i, part) in trimmed.split('.').enumerate() {
            if i >= parts.len() {
                return Err(invalid());
            }
            parts[i] = part.parse().map_err(|_| invalid())?;
        }

        Ok(OsVersion::new(parts[0], parts[1], parts[2]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_os_version() {
        assert_eq!(
            OsVersion::from_str("14.2.1").unwrap(),
            OsVersion::new(14, 2, 1)
        );
        assert_eq!(
            OsVersion::from_str("13.6\n").unwrap(),
            OsVersion::new(13, 6, 0)
        );
        assert_eq!(OsVersion::from_str("15").unwrap(), OsVersion::new(15, 0, 0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(OsVersion::from_str("").is_err());
        assert!(OsVersion::from_str("Sonoma").is_err());
        assert!(OsVersion::from_str("14.2.1.9").is_err());
        assert!(OsVersion::from_str("14..1").is_err());
    }

    #[test]
    fn test_is_at_least() {
        assert!(OsVersion::new(14, 0, 0).is_at_least(14));
        assert!(OsVersion::new(15, 1, 0).is_at_least(14));
        assert!(!OsVersion::new(13, 6, 9).is_at_least(14));
    }

    #[test]
    fn test_display_os_version() {
        assert_eq!(OsVersion::new(13, 6, 0).to_string(), "13.6.0");
    }
}
