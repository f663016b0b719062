//! Trip storage boundary.
//!
//! The store is the single source of truth for trips and their fixes. The
//! tracking engine is the only writer for the active trip; any number of
//! readers (history screens, the route monitor) may query concurrently.

use tokio::sync::watch;

use crate::{GpsFix, Result, Trip, TripId};

#[cfg(feature = "persistence")]
pub mod migrations;

#[cfg(feature = "persistence")]
pub mod sqlite;

/// Durable storage of trips and their ordered fixes.
///
/// Every operation may fail with [`crate::TrackerError::StorageFailure`] and is
/// durable once it returns `Ok`.
pub trait TripStore: Send + Sync {
    /// Insert a new active trip starting at `start_time_ms`.
    fn create_trip(&self, start_time_ms: i64) -> Result<TripId>;

    /// Close a trip: set its end time and final figures and clear the active flag.
    fn finalize_trip(
        &self,
        trip_id: TripId,
        end_time_ms: i64,
        total_distance_km: f64,
        duration_ms: i64,
    ) -> Result<()>;

    /// Append a fix to the end of a trip's sequence.
    fn append_fix(&self, trip_id: TripId, fix: &GpsFix) -> Result<()>;

    /// The trip marked active, with its fixes.
    fn get_active_trip(&self) -> Result<Option<Trip>>;

    /// A trip with its fixes.
    fn get_trip_by_id(&self, trip_id: TripId) -> Result<Option<Trip>>;

    /// All trips, newest first, without fixes (`point_count` is filled).
    fn list_trips(&self) -> Result<Vec<Trip>>;

    /// Delete a trip and all of its fixes.
    fn delete_trip(&self, trip_id: TripId) -> Result<()>;

    /// Set or clear the user-assigned name.
    fn rename_trip(&self, trip_id: TripId, name: Option<&str>) -> Result<()>;

    fn count_fixes(&self, trip_id: TripId) -> Result<u32>;

    fn last_fix(&self, trip_id: TripId) -> Result<Option<GpsFix>>;

    /// Revision counter bumped after every write, for observers that keep a
    /// trip list on screen. Stores that cannot notify return None.
    fn subscribe(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}

/// Normalize a user-entered trip name: trimmed, empty means no name.
pub fn normalize_name(name: Option<&str>) -> Option<String> {
    name.map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}
