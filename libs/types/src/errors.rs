//! Error types shared across the price feed
//!
//! Comprehensive error taxonomy using thiserror

use thiserror::Error;

/// Failure to obtain the raw calendar text.
///
/// The producer treats every variant as "zero events"; these never stop a tick.
#[derive(Error, Debug)]
pub enum CalendarError {
    #[error("Calendar file not found: {path}")]
    NotFound { path: String },

    #[error("Calendar unreadable: {0}")]
    Io(#[from] std::io::Error),

    #[error("Calendar is not valid UTF-8: {path}")]
    InvalidEncoding { path: String },
}

/// Persistence port errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Invalid range: start {start} is after end {end}")]
    InvalidRange { start: String, end: String },

    #[error("Store lock poisoned")]
    Poisoned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calendar_error_display() {
        let err = CalendarError::NotFound {
            path: "coefficients/schedule.ics".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Calendar file not found: coefficients/schedule.ics"
        );
    }

    #[test]
    fn test_calendar_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: CalendarError = io.into();
        assert!(matches!(err, CalendarError::Io(_)));
    }

    #[test]
    fn test_store_error_invalid_range() {
        let err = StoreError::InvalidRange {
            start: "b".to_string(),
            end: "a".to_string(),
        };
        assert!(err.to_string().contains("start b"));
    }
}
