//! # SQLite Trip Store
//!
//! [`TripStore`] backed by a single SQLite database.
//!
//! ## Schema
//!
//! - `trips` - one row per trip, `is_active = 1` on at most one row
//!   (enforced by a partial unique index)
//! - `gps_points` - accepted fixes, `id` order is chronological order,
//!   cascade-deleted with their trip
//!
//! The connection sits behind a mutex so history readers and the engine
//! can share one store.

use std::sync::{Mutex, MutexGuard};

use log::{debug, info, warn};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use tokio::sync::watch;

use super::{TripStore, migrations, normalize_name};
use crate::{GpsFix, Result, TrackerError, Trip, TripId};

const TRIP_COLUMNS: &str = "id, start_time, end_time, total_distance, duration, is_active, name, \
     (SELECT COUNT(*) FROM gps_points WHERE gps_points.trip_id = trips.id)";

/// SQLite-backed trip store.
pub struct SqliteTripStore {
    conn: Mutex<Connection>,
    revision: watch::Sender<u64>,
}

impl SqliteTripStore {
    /// Open (or create) the database at `db_path` and bring the schema up to date.
    pub fn open(db_path: &str) -> Result<Self> {
        let mut conn = Connection::open(db_path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        if db_path != ":memory:" {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            debug!("[TripStore] journal_mode={}", mode);
        }
        migrations::migrations().to_latest(&mut conn)?;
        info!("[TripStore] Opened {}", db_path);

        let (revision, _) = watch::channel(0);
        Ok(Self {
            conn: Mutex::new(conn),
            revision,
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    fn active_trip_id(conn: &Connection) -> Result<Option<TripId>> {
        let id = conn
            .query_row("SELECT id FROM trips WHERE is_active = 1 LIMIT 1", [], |row| {
                row.get::<_, i64>(0)
            })
            .optional()?;
        Ok(id.map(TripId))
    }

    fn load_trip(conn: &Connection, trip_id: TripId) -> Result<Option<Trip>> {
        let sql = format!("SELECT {} FROM trips WHERE id = ?", TRIP_COLUMNS);
        let trip = conn
            .query_row(&sql, params![trip_id.0], trip_from_row)
            .optional()?;

        match trip {
            Some(mut trip) => {
                trip.fixes = Self::load_fixes(conn, trip_id)?;
                Ok(Some(trip))
            }
            None => Ok(None),
        }
    }

    fn load_fixes(conn: &Connection, trip_id: TripId) -> Result<Vec<GpsFix>> {
        let mut stmt = conn.prepare_cached(
            "SELECT latitude, longitude, timestamp, accuracy FROM gps_points
             WHERE trip_id = ? ORDER BY id",
        )?;
        let fixes = stmt
            .query_map(params![trip_id.0], fix_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(fixes)
    }
}

fn trip_from_row(row: &Row<'_>) -> rusqlite::Result<Trip> {
    let point_count: i64 = row.get(7)?;
    Ok(Trip {
        id: TripId(row.get(0)?),
        start_time_ms: row.get(1)?,
        end_time_ms: row.get(2)?,
        total_distance_km: row.get(3)?,
        duration_ms: row.get(4)?,
        is_active: row.get::<_, i64>(5)? == 1,
        name: row.get(6)?,
        point_count: u32::try_from(point_count).unwrap_or(u32::MAX),
        fixes: Vec::new(),
    })
}

fn fix_from_row(row: &Row<'_>) -> rusqlite::Result<GpsFix> {
    Ok(GpsFix {
        latitude: row.get(0)?,
        longitude: row.get(1)?,
        timestamp_ms: row.get(2)?,
        accuracy_m: row.get(3)?,
    })
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

impl TripStore for SqliteTripStore {
    fn create_trip(&self, start_time_ms: i64) -> Result<TripId> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT INTO trips (start_time, end_time, total_distance, duration, is_active, name)
             VALUES (?, NULL, 0, 0, 1, NULL)",
            params![start_time_ms],
        );

        match inserted {
            Ok(_) => {
                let trip_id = TripId(conn.last_insert_rowid());
                drop(conn);
                self.bump_revision();
                debug!("[TripStore] Created trip {}", trip_id);
                Ok(trip_id)
            }
            Err(e) if is_constraint_violation(&e) => {
                // The single-active index refused a second active trip
                match Self::active_trip_id(&conn)? {
                    Some(trip_id) => Err(TrackerError::OrphanedTrip { trip_id }),
                    None => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn finalize_trip(
        &self,
        trip_id: TripId,
        end_time_ms: i64,
        total_distance_km: f64,
        duration_ms: i64,
    ) -> Result<()> {
        let updated = self.lock().execute(
            "UPDATE trips SET end_time = ?, total_distance = ?, duration = ?, is_active = 0
             WHERE id = ?",
            params![end_time_ms, total_distance_km, duration_ms, trip_id.0],
        )?;
        if updated == 0 {
            return Err(TrackerError::TripNotFound { trip_id });
        }
        self.bump_revision();
        Ok(())
    }

    fn append_fix(&self, trip_id: TripId, fix: &GpsFix) -> Result<()> {
        self.lock().execute(
            "INSERT INTO gps_points (trip_id, latitude, longitude, timestamp, accuracy)
             VALUES (?, ?, ?, ?, ?)",
            params![
                trip_id.0,
                fix.latitude,
                fix.longitude,
                fix.timestamp_ms,
                fix.accuracy_m
            ],
        )?;
        self.bump_revision();
        Ok(())
    }

    fn get_active_trip(&self) -> Result<Option<Trip>> {
        let conn = self.lock();
        match Self::active_trip_id(&conn)? {
            Some(trip_id) => Self::load_trip(&conn, trip_id),
            None => Ok(None),
        }
    }

    fn get_trip_by_id(&self, trip_id: TripId) -> Result<Option<Trip>> {
        Self::load_trip(&self.lock(), trip_id)
    }

    fn list_trips(&self) -> Result<Vec<Trip>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {} FROM trips ORDER BY start_time DESC, id DESC",
            TRIP_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let trips = stmt
            .query_map([], trip_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(trips)
    }

    fn delete_trip(&self, trip_id: TripId) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        // Cascade would cover this; delete explicitly in case foreign keys are off
        let points = tx.execute("DELETE FROM gps_points WHERE trip_id = ?", params![trip_id.0])?;
        let trips = tx.execute("DELETE FROM trips WHERE id = ?", params![trip_id.0])?;
        if trips == 0 {
            return Err(TrackerError::TripNotFound { trip_id });
        }
        tx.commit()?;
        drop(conn);

        self.bump_revision();
        info!("[TripStore] Deleted trip {} ({} points)", trip_id, points);
        Ok(())
    }

    fn rename_trip(&self, trip_id: TripId, name: Option<&str>) -> Result<()> {
        let name = normalize_name(name);
        let updated = self.lock().execute(
            "UPDATE trips SET name = ? WHERE id = ?",
            params![name, trip_id.0],
        )?;
        if updated == 0 {
            return Err(TrackerError::TripNotFound { trip_id });
        }
        self.bump_revision();
        Ok(())
    }

    fn count_fixes(&self, trip_id: TripId) -> Result<u32> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM gps_points WHERE trip_id = ?",
            params![trip_id.0],
            |row| row.get(0),
        )?;
        Ok(u32::try_from(count).unwrap_or_else(|_| {
            warn!("[TripStore] Point count overflow for trip {}", trip_id);
            u32::MAX
        }))
    }

    fn last_fix(&self, trip_id: TripId) -> Result<Option<GpsFix>> {
        let fix = self
            .lock()
            .query_row(
                "SELECT latitude, longitude, timestamp, accuracy FROM gps_points
                 WHERE trip_id = ? ORDER BY id DESC LIMIT 1",
                params![trip_id.0],
                fix_from_row,
            )
            .optional()?;
        Ok(fix)
    }

    fn subscribe(&self) -> Option<watch::Receiver<u64>> {
        Some(self.revision.subscribe())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(lng: f64, t: i64) -> GpsFix {
        GpsFix::new(51.5, lng, t).with_accuracy(5.0)
    }

    #[test]
    fn test_create_and_finalize() {
        let store = SqliteTripStore::in_memory().unwrap();
        let id = store.create_trip(1_000).unwrap();

        let active = store.get_active_trip().unwrap().unwrap();
        assert_eq!(active.id, id);
        assert!(active.is_active);
        assert_eq!(active.end_time_ms, None);

        store.finalize_trip(id, 6_000, 1.25, 5_000).unwrap();
        assert!(store.get_active_trip().unwrap().is_none());

        let trip = store.get_trip_by_id(id).unwrap().unwrap();
        assert!(!trip.is_active);
        assert_eq!(trip.end_time_ms, Some(6_000));
        assert_eq!(trip.total_distance_km, 1.25);
        assert_eq!(trip.duration_ms, 5_000);
    }

    #[test]
    fn test_trip_ids_increase() {
        let store = SqliteTripStore::in_memory().unwrap();
        let a = store.create_trip(1_000).unwrap();
        store.finalize_trip(a, 2_000, 0.0, 1_000).unwrap();
        let b = store.create_trip(3_000).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_single_active_trip_enforced_by_schema() {
        let store = SqliteTripStore::in_memory().unwrap();
        let first = store.create_trip(1_000).unwrap();
        assert_eq!(
            store.create_trip(2_000),
            Err(TrackerError::OrphanedTrip { trip_id: first })
        );
        assert_eq!(store.list_trips().unwrap().len(), 1);
    }

    #[test]
    fn test_fixes_keep_insertion_order_and_accuracy() {
        let store = SqliteTripStore::in_memory().unwrap();
        let id = store.create_trip(0).unwrap();
        for i in 0..5 {
            store.append_fix(id, &fix(i as f64 * 0.001, 1_000 * i)).unwrap();
        }
        store.append_fix(id, &GpsFix::new(51.5, 0.01, 9_000)).unwrap();

        let trip = store.get_trip_by_id(id).unwrap().unwrap();
        assert_eq!(trip.point_count, 6);
        let stamps: Vec<i64> = trip.fixes.iter().map(|f| f.timestamp_ms).collect();
        assert_eq!(stamps, vec![0, 1_000, 2_000, 3_000, 4_000, 9_000]);
        assert_eq!(trip.fixes[0].accuracy_m, Some(5.0));
        assert_eq!(trip.fixes[5].accuracy_m, None);

        assert_eq!(store.count_fixes(id).unwrap(), 6);
        assert_eq!(store.last_fix(id).unwrap().unwrap().timestamp_ms, 9_000);
    }

    #[test]
    fn test_append_to_missing_trip_fails() {
        let store = SqliteTripStore::in_memory().unwrap();
        let result = store.append_fix(TripId(99), &fix(0.0, 0));
        assert!(matches!(result, Err(TrackerError::StorageFailure { .. })));
    }

    #[test]
    fn test_delete_cascades_to_fixes() {
        let store = SqliteTripStore::in_memory().unwrap();
        let id = store.create_trip(0).unwrap();
        store.append_fix(id, &fix(0.0, 0)).unwrap();
        store.append_fix(id, &fix(0.001, 1_000)).unwrap();
        store.finalize_trip(id, 1_000, 0.07, 1_000).unwrap();

        store.delete_trip(id).unwrap();
        assert!(store.get_trip_by_id(id).unwrap().is_none());
        assert_eq!(store.count_fixes(id).unwrap(), 0);
        assert!(store.last_fix(id).unwrap().is_none());
        assert_eq!(
            store.delete_trip(id),
            Err(TrackerError::TripNotFound { trip_id: id })
        );
    }

    #[test]
    fn test_rename_and_clear_name() {
        let store = SqliteTripStore::in_memory().unwrap();
        let id = store.create_trip(0).unwrap();

        store.rename_trip(id, Some(" Morning ride ")).unwrap();
        let trip = store.get_trip_by_id(id).unwrap().unwrap();
        assert_eq!(trip.name.as_deref(), Some("Morning ride"));

        store.rename_trip(id, Some("")).unwrap();
        assert_eq!(store.get_trip_by_id(id).unwrap().unwrap().name, None);

        assert_eq!(
            store.rename_trip(TripId(77), Some("x")),
            Err(TrackerError::TripNotFound { trip_id: TripId(77) })
        );
    }

    #[test]
    fn test_list_is_newest_first_without_fixes() {
        let store = SqliteTripStore::in_memory().unwrap();
        let older = store.create_trip(1_000).unwrap();
        store.append_fix(older, &fix(0.0, 1_000)).unwrap();
        store.finalize_trip(older, 2_000, 0.0, 1_000).unwrap();
        let newer = store.create_trip(5_000).unwrap();

        let trips = store.list_trips().unwrap();
        let ids: Vec<TripId> = trips.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![newer, older]);
        assert_eq!(trips[1].point_count, 1);
        assert!(trips.iter().all(|t| t.fixes.is_empty()));
    }

    #[test]
    fn test_revision_bumps_on_writes() {
        let store = SqliteTripStore::in_memory().unwrap();
        let rx = store.subscribe().unwrap();
        assert_eq!(*rx.borrow(), 0);

        let id = store.create_trip(0).unwrap();
        store.append_fix(id, &fix(0.0, 0)).unwrap();
        store.finalize_trip(id, 10, 0.0, 10).unwrap();
        assert_eq!(*rx.borrow(), 3);

        // Reads do not bump
        store.list_trips().unwrap();
        assert_eq!(*rx.borrow(), 3);
    }

    #[test]
    fn test_reopen_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trips.db");
        let path = path.to_str().unwrap();

        let id = {
            let store = SqliteTripStore::open(path).unwrap();
            let id = store.create_trip(1_000).unwrap();
            store.append_fix(id, &fix(0.0, 1_000)).unwrap();
            id
        };

        let store = SqliteTripStore::open(path).unwrap();
        let active = store.get_active_trip().unwrap().unwrap();
        assert_eq!(active.id, id);
        assert_eq!(active.fixes.len(), 1);
    }
}
