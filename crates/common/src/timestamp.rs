//! Timestamp utilities.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Audit log record format.
pub const LOG_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Backup directory suffix format, second resolution.
pub const BACKUP_SUFFIX_FORMAT: &str = "%Y%m%d%H%M%S";

/// A wrapper around local wall-clock time with consistent formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Local>);

impl Timestamp {
    /// Create a new timestamp from the current time.
    pub fn now() -> Self {
        Timestamp(Local::now())
    }

    /// Create a timestamp from a DateTime<Local>.
    pub fn from_datetime(dt: DateTime<Local>) -> Self {
        Timestamp(dt)
    }

    /// Format for audit log records.
    pub fn to_log_format(&self) -> String {
        self.0.format(LOG_FORMAT).to_string()
    }

    /// Format as a backup name suffix (`YYYYMMDDHHMMSS`).
    pub fn to_backup_suffix(&self) -> String {
        self.0.format(BACKUP_SUFFIX_FORMAT).to_string()
    }

    /// Duration between this timestamp and a later one.
    pub fn until(&self, later: &Timestamp) -> chrono::Duration {
        later.0 - self.0
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_log_format())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed() -> Timestamp {
        let dt = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap();
        Timestamp::from_datetime(dt)
    }

    #[test]
    fn test_backup_suffix_is_second_resolution() {
        assert_eq!(fixed().to_backup_suffix(), "20240307090502");
    }

    #[test]
    fn test_log_format() {
        assert_eq!(fixed().to_log_format(), "2024-03-07 09:05:02");
        assert_eq!(fixed().to_string(), "2024-03-07 09:05:02");
    }

    #[test]
    fn test_timestamp_serialization() {
        let ts = Timestamp::now();
        let json = serde_json::to_string(&ts).unwrap();
        let parsed: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(ts, parsed);
    }
}
