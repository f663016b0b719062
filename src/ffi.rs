//! FFI bindings for mobile platforms (iOS/Android).
//!
//! The host app calls `tracker_init` once with its database path, then drives
//! the engine with `tracker_start` / `tracker_stop` and forwards every platform
//! location callback to `tracker_push_fix`. Collections cross the boundary as
//! JSON strings; failures are logged and reported as `false` / `None`.

use std::sync::{Arc, Mutex, Weak};

use log::{error, info, warn};
use once_cell::sync::Lazy;

use crate::engine::{EngineStats, Recovery, StartOutcome, StopOutcome, TrackingEngine};
use crate::location::PushLocationSource;
use crate::store::sqlite::SqliteTripStore;
use crate::store::TripStore;
use crate::{format, init_logging, GpsFix, TrackingConfig, TrackingState, TripId, TripSummary};

// ============================================================================
// Global Runtime
// ============================================================================

/// Everything the host needs for one tracking session.
struct TrackerRuntime {
    engine: TrackingEngine,
    store: Arc<SqliteTripStore>,
    source: PushLocationSource,
}

/// Global tracker instance.
///
/// Lets the host reach the engine without passing handles across the FFI
/// boundary.
static TRACKER: Lazy<Mutex<Option<Arc<TrackerRuntime>>>> = Lazy::new(|| Mutex::new(None));

/// A shut down tracker still held by an in-flight call.
static RETIRING: Lazy<Mutex<Option<Weak<TrackerRuntime>>>> = Lazy::new(|| Mutex::new(None));

/// Whether a previous tracker is still running. Its engine may be tracking a
/// trip that a new engine on the same database would recover out from under it.
fn retiring_tracker_alive() -> bool {
    let Ok(mut retiring) = RETIRING.lock() else {
        return true;
    };
    let alive = retiring.as_ref().is_some_and(|weak| weak.strong_count() > 0);
    if !alive {
        *retiring = None;
    }
    alive
}

/// Run `f` against the tracker. The global lock is released before `f` runs,
/// so a slow storage call never blocks fix delivery.
fn with_tracker<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&TrackerRuntime) -> R,
{
    let runtime = TRACKER.lock().ok()?.as_ref().map(Arc::clone);
    match runtime {
        Some(runtime) => Some(f(&runtime)),
        None => {
            warn!("[TrackerFFI] Tracker not initialized");
            None
        }
    }
}

// ============================================================================
// FFI Types
// ============================================================================

/// Flattened [`TrackingState`] for hosts without sum types.
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct FfiTrackingState {
    pub is_active: bool,
    pub trip_id: Option<i64>,
    pub distance_km: f64,
    pub duration_ms: i64,
    pub points_count: u32,
    pub unsaved_points: u32,
}

impl From<&TrackingState> for FfiTrackingState {
    fn from(state: &TrackingState) -> Self {
        match state {
            TrackingState::Idle => Self {
                is_active: false,
                trip_id: None,
                distance_km: 0.0,
                duration_ms: 0,
                points_count: 0,
                unsaved_points: 0,
            },
            TrackingState::Active {
                trip_id,
                current_distance_km,
                current_duration_ms,
                points_count,
                unsaved_points,
            } => Self {
                is_active: true,
                trip_id: Some(trip_id.0),
                distance_km: *current_distance_km,
                duration_ms: *current_duration_ms,
                points_count: *points_count,
                unsaved_points: *unsaved_points,
            },
        }
    }
}

/// Figures shown in the end-of-trip dialog.
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct FfiTripSummary {
    pub trip_id: i64,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub distance_km: f64,
    pub duration_ms: i64,
    pub points_count: u32,
    pub unsaved_points: u32,
}

impl From<TripSummary> for FfiTripSummary {
    fn from(s: TripSummary) -> Self {
        Self {
            trip_id: s.trip_id.0,
            start_time_ms: s.start_time_ms,
            end_time_ms: s.end_time_ms,
            distance_km: s.distance_km,
            duration_ms: s.duration_ms,
            points_count: s.points_count,
            unsaved_points: s.unsaved_points,
        }
    }
}

#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct FfiEngineStats {
    pub accepted_fixes: u64,
    pub low_quality_fixes: u64,
    pub invalid_fixes: u64,
    pub stale_fixes: u64,
    pub persistence_failures: u64,
    pub degraded_stops: u64,
    /// Fixes pushed while no trip was subscribed
    pub dropped_fixes: u64,
}

impl FfiEngineStats {
    fn new(stats: EngineStats, dropped_fixes: u64) -> Self {
        Self {
            accepted_fixes: stats.accepted_fixes,
            low_quality_fixes: stats.low_quality_fixes,
            invalid_fixes: stats.invalid_fixes,
            stale_fixes: stats.stale_fixes,
            persistence_failures: stats.persistence_failures,
            degraded_stops: stats.degraded_stops,
            dropped_fixes,
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Open the trip database and start the engine.
///
/// `config_json` may be partial; missing fields take their defaults. Any
/// previously initialized tracker is shut down first. A trip left active by a
/// killed process is handled according to the configured orphan policy.
#[uniffi::export]
pub fn tracker_init(db_path: String, config_json: Option<String>) -> bool {
    init_logging();
    info!("[TrackerFFI] Initializing with db: {}", db_path);

    tracker_shutdown();
    if retiring_tracker_alive() {
        error!("[TrackerFFI] Previous tracker still in use, refusing to initialize");
        return false;
    }

    let config = match config_json.as_deref().map(TrackingConfig::from_json) {
        None => TrackingConfig::default(),
        Some(Ok(config)) => config,
        Some(Err(e)) => {
            error!("[TrackerFFI] Invalid config: {}", e);
            return false;
        }
    };

    let store = match SqliteTripStore::open(&db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("[TrackerFFI] Failed to open trip store: {}", e);
            return false;
        }
    };
    let source = PushLocationSource::new();

    let engine = match TrackingEngine::new(store.clone(), Box::new(source.clone()), config) {
        Ok(engine) => engine,
        Err(e) => {
            error!("[TrackerFFI] Failed to create engine: {}", e);
            return false;
        }
    };

    match engine.recovery() {
        Recovery::Clean => {}
        Recovery::Finalized(summary) => info!(
            "[TrackerFFI] Closed trip {} left active by a previous run",
            summary.trip_id
        ),
        Recovery::Resumed { trip_id, .. } => {
            info!("[TrackerFFI] Resumed trip {}", trip_id)
        }
    }

    let Ok(mut guard) = TRACKER.lock() else {
        error!("[TrackerFFI] Tracker lock poisoned");
        return false;
    };
    *guard = Some(Arc::new(TrackerRuntime {
        engine,
        store,
        source,
    }));
    info!("[TrackerFFI] Initialized successfully");
    true
}

/// Stop the engine without finalizing an active trip; the next
/// `tracker_init` recovers it.
#[uniffi::export]
pub fn tracker_shutdown() {
    let runtime = match TRACKER.lock() {
        Ok(mut guard) => guard.take(),
        Err(_) => None,
    };
    let Some(runtime) = runtime else {
        return;
    };

    match Arc::try_unwrap(runtime) {
        Ok(runtime) => runtime.engine.shutdown(),
        // A concurrent call still holds it; the engine stops when that call returns
        Err(runtime) => {
            warn!("[TrackerFFI] Tracker still in use, deferring shutdown");
            if let Ok(mut retiring) = RETIRING.lock() {
                *retiring = Some(Arc::downgrade(&runtime));
            }
        }
    }
    info!("[TrackerFFI] Shut down");
}

// ============================================================================
// Tracking
// ============================================================================

/// Start a trip. Returns the id of the trip being tracked (new or already
/// active), or None if the trip could not be started.
#[uniffi::export]
pub fn tracker_start() -> Option<i64> {
    with_tracker(|t| match t.engine.start() {
        Ok(StartOutcome::Started(trip_id)) | Ok(StartOutcome::AlreadyActive(trip_id)) => {
            Some(trip_id.0)
        }
        Err(e) => {
            error!("[TrackerFFI] Start failed: {}", e);
            None
        }
    })
    .flatten()
}

/// Stop the current trip. Returns its final figures, or None if nothing was
/// being tracked or the trip could not be finalized.
#[uniffi::export]
pub fn tracker_stop() -> Option<FfiTripSummary> {
    with_tracker(|t| match t.engine.stop() {
        Ok(StopOutcome::Stopped(summary)) => Some(summary.into()),
        Ok(StopOutcome::AlreadyIdle) => None,
        Err(e) => {
            error!("[TrackerFFI] Stop failed: {}", e);
            None
        }
    })
    .flatten()
}

/// Forward one platform location callback. Returns false if no trip is
/// subscribed.
#[uniffi::export]
pub fn tracker_push_fix(
    latitude: f64,
    longitude: f64,
    timestamp_ms: i64,
    accuracy_m: Option<f64>,
) -> bool {
    with_tracker(|t| {
        t.source.push(GpsFix {
            latitude,
            longitude,
            timestamp_ms,
            accuracy_m,
        })
    })
    .unwrap_or(false)
}

/// Report the current location permission state.
#[uniffi::export]
pub fn tracker_set_permission(granted: bool) {
    with_tracker(|t| t.source.set_permission(granted));
}

#[uniffi::export]
pub fn tracker_get_state() -> FfiTrackingState {
    let state = with_tracker(|t| t.engine.state()).unwrap_or(TrackingState::Idle);
    FfiTrackingState::from(&state)
}

/// Current state as JSON, tagged by `status` (`idle` / `active`).
#[uniffi::export]
pub fn tracker_get_state_json() -> String {
    let state = with_tracker(|t| t.engine.state()).unwrap_or(TrackingState::Idle);
    serde_json::to_string(&state).unwrap_or_else(|_| "{}".to_string())
}

#[uniffi::export]
pub fn tracker_get_stats() -> Option<FfiEngineStats> {
    with_tracker(|t| FfiEngineStats::new(t.engine.stats(), t.source.dropped_count()))
}

// ============================================================================
// History
// ============================================================================

/// All trips, newest first, without their fixes. "[]" when unavailable.
#[uniffi::export]
pub fn tracker_list_trips_json() -> String {
    with_tracker(|t| match t.store.list_trips() {
        Ok(trips) => serde_json::to_string(&trips).ok(),
        Err(e) => {
            error!("[TrackerFFI] Failed to list trips: {}", e);
            None
        }
    })
    .flatten()
    .unwrap_or_else(|| "[]".to_string())
}

/// One trip with its fixes.
#[uniffi::export]
pub fn tracker_get_trip_json(trip_id: i64) -> Option<String> {
    with_tracker(|t| match t.store.get_trip_by_id(TripId(trip_id)) {
        Ok(trip) => trip.and_then(|trip| serde_json::to_string(&trip).ok()),
        Err(e) => {
            error!("[TrackerFFI] Failed to load trip {}: {}", trip_id, e);
            None
        }
    })
    .flatten()
}

#[uniffi::export]
pub fn tracker_delete_trip(trip_id: i64) -> bool {
    with_tracker(|t| match t.engine.delete_trip(TripId(trip_id)) {
        Ok(()) => true,
        Err(e) => {
            error!("[TrackerFFI] Failed to delete trip {}: {}", trip_id, e);
            false
        }
    })
    .unwrap_or(false)
}

#[uniffi::export]
pub fn tracker_rename_trip(trip_id: i64, name: Option<String>) -> bool {
    with_tracker(
        |t| match t.engine.rename_trip(TripId(trip_id), name.as_deref()) {
            Ok(()) => true,
            Err(e) => {
                error!("[TrackerFFI] Failed to rename trip {}: {}", trip_id, e);
                false
            }
        },
    )
    .unwrap_or(false)
}

// ============================================================================
// Formatting
// ============================================================================

/// `HH:MM:SS`
#[uniffi::export]
pub fn ffi_format_duration(duration_ms: i64) -> String {
    format::format_duration(duration_ms)
}
