//! Unified error handling for the trip tracker.
//!
//! Only failures that a caller must act on are errors. Redundant commands
//! (start while active, stop while idle) and low-quality fixes are reported
//! through outcomes and counters instead.

use thiserror::Error;

use crate::TripId;

/// Unified error type for trip tracker operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackerError {
    /// Location access is not granted
    #[error("Location permission denied")]
    PermissionDenied,

    /// The location source could not be started
    #[error("Location source unavailable: {message}")]
    LocationUnavailable { message: String },

    /// A trip store operation failed
    #[error("Storage failure: {message}")]
    StorageFailure { message: String },

    /// Storage reports an active trip the engine does not own
    #[error("Trip {trip_id} is still marked active in storage")]
    OrphanedTrip { trip_id: TripId },

    #[error("Trip {trip_id} not found")]
    TripNotFound { trip_id: TripId },

    /// The operation would modify the trip currently being tracked
    #[error("Trip {trip_id} is being tracked")]
    TripActive { trip_id: TripId },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// The engine worker is no longer running
    #[error("Tracking engine has shut down")]
    EngineStopped,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TrackerError {
    pub fn storage(message: impl Into<String>) -> Self {
        TrackerError::StorageFailure {
            message: message.into(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for TrackerError {
    fn from(e: rusqlite::Error) -> Self {
        TrackerError::storage(e.to_string())
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite_migration::Error> for TrackerError {
    fn from(e: rusqlite_migration::Error) -> Self {
        TrackerError::storage(format!("migration failed: {}", e))
    }
}

/// Result type alias for trip tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrackerError::OrphanedTrip { trip_id: TripId(42) };
        assert!(err.to_string().contains("42"));

        let err = TrackerError::storage("disk full");
        assert_eq!(err.to_string(), "Storage failure: disk full");
    }

    #[cfg(feature = "persistence")]
    #[test]
    fn test_sqlite_error_maps_to_storage_failure() {
        let err: TrackerError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, TrackerError::StorageFailure { .. }));
    }
}
