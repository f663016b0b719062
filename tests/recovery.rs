//! Recovery of trips left active by a killed process, across database reopens.

mod common;

use std::sync::Arc;

use common::*;
use tempfile::TempDir;
use trip_tracker::{
    OrphanPolicy, PushLocationSource, Recovery, SqliteTripStore, StartOutcome, StopOutcome,
    TrackingConfig, TrackingEngine, TrackingState, TripId, TripStore,
};

/// Helper: a database on disk holding one active trip with `fixes`, as a
/// killed process leaves it.
fn orphaned_db(fixes: &[trip_tracker::GpsFix]) -> (TempDir, String, TripId) {
    let tmp_dir = TempDir::new().expect("failed to create temp dir");
    let db_path = tmp_dir
        .path()
        .join("trips.db")
        .to_string_lossy()
        .to_string();

    let store = SqliteTripStore::open(&db_path).expect("failed to open store");
    let trip_id = store.create_trip(T0).unwrap();
    for fix in fixes {
        store.append_fix(trip_id, fix).unwrap();
    }
    drop(store);

    (tmp_dir, db_path, trip_id)
}

fn reopen(db_path: &str) -> Arc<SqliteTripStore> {
    Arc::new(SqliteTripStore::open(db_path).expect("failed to reopen store"))
}

#[test]
fn test_orphan_is_finalized_from_persisted_fixes() {
    let (_tmp, db_path, trip_id) = orphaned_db(&[
        fix(0.0, T0 + 1_000),
        fix(0.000027, T0 + 2_000), // below the movement threshold
        fix(0.001, T0 + 7_000),
    ]);

    let store = reopen(&db_path);
    let h = Harness::new(store.clone(), TrackingConfig::default());

    let Recovery::Finalized(summary) = h.engine.recovery().clone() else {
        panic!("expected a finalized orphan, got {:?}", h.engine.recovery());
    };
    assert_eq!(summary.trip_id, trip_id);
    assert_eq!(summary.end_time_ms, T0 + 7_000);
    assert_eq!(summary.duration_ms, 7_000);
    assert_eq!(summary.points_count, 3);
    assert!((summary.distance_km - 0.108).abs() < 0.001);
    assert_eq!(h.engine.state(), TrackingState::Idle);

    let trip = store.get_trip_by_id(trip_id).unwrap().unwrap();
    assert!(!trip.is_active);
    assert_eq!(trip.end_time_ms, Some(T0 + 7_000));
    assert_eq!(trip.duration_ms, 7_000);
    assert!((trip.total_distance_km - summary.distance_km).abs() < 1e-12);

    // Nothing blocks a new trip afterwards
    assert!(matches!(h.engine.start(), Ok(StartOutcome::Started(_))));
}

#[test]
fn test_orphan_without_fixes_ends_at_start() {
    let (_tmp, db_path, trip_id) = orphaned_db(&[]);

    let store = reopen(&db_path);
    let h = Harness::new(store.clone(), TrackingConfig::default());

    let Recovery::Finalized(summary) = h.engine.recovery().clone() else {
        panic!("expected a finalized orphan");
    };
    assert_eq!(summary.trip_id, trip_id);
    assert_eq!(summary.end_time_ms, T0);
    assert_eq!(summary.duration_ms, 0);
    assert_eq!(summary.distance_km, 0.0);
}

#[test]
fn test_orphan_is_resumed() {
    let (_tmp, db_path, trip_id) = orphaned_db(&[fix(0.0, T0 + 1_000), fix(0.001, T0 + 6_000)]);

    let store = reopen(&db_path);
    let config = TrackingConfig {
        orphan_policy: OrphanPolicy::Resume,
        ..TrackingConfig::default()
    };
    let h = Harness::new(store.clone(), config);

    match h.engine.recovery() {
        Recovery::Resumed {
            trip_id: resumed,
            distance_km,
            points_count,
        } => {
            assert_eq!(*resumed, trip_id);
            assert!((distance_km - MILLI_DEGREE_KM).abs() < 1e-3);
            assert_eq!(*points_count, 2);
        }
        other => panic!("expected a resumed trip, got {:?}", other),
    }
    assert_eq!(h.source.subscribed_trip(), Some(trip_id));
    assert_eq!(h.engine.state().trip_id(), Some(trip_id));

    // Distance continues from the last persisted fix
    h.feed(fix(0.002, T0 + 11_000));
    let StopOutcome::Stopped(summary) = h.engine.stop().unwrap() else {
        panic!("expected a stopped trip");
    };
    assert_eq!(summary.trip_id, trip_id);
    assert_eq!(summary.points_count, 3);
    assert!((summary.distance_km - 2.0 * MILLI_DEGREE_KM).abs() < 1e-3);
    assert_eq!(summary.duration_ms, 11_000);
    assert_eq!(store.count_fixes(trip_id).unwrap(), 3);
}

#[test]
fn test_resume_without_permission_falls_back_to_finalize() {
    init_logger();
    let (_tmp, db_path, trip_id) = orphaned_db(&[fix(0.0, T0 + 1_000)]);

    let store = reopen(&db_path);
    let source = PushLocationSource::new();
    source.set_permission(false);
    let config = TrackingConfig {
        orphan_policy: OrphanPolicy::Resume,
        ..TrackingConfig::default()
    };
    let engine = TrackingEngine::new(store.clone(), Box::new(source.clone()), config).unwrap();

    assert!(matches!(engine.recovery(), Recovery::Finalized(s) if s.trip_id == trip_id));
    assert!(!source.is_subscribed());
    assert!(store.get_active_trip().unwrap().is_none());
}

#[test]
fn test_shutdown_then_reopen_recovers() {
    let tmp_dir = TempDir::new().unwrap();
    let db_path = tmp_dir.path().join("trips.db").to_string_lossy().to_string();

    let trip_id = {
        let h = Harness::new(reopen(&db_path), TrackingConfig::default());
        let StartOutcome::Started(trip_id) = h.engine.start().unwrap() else {
            panic!("expected a new trip");
        };
        h.feed(fix(0.0, T0 + 1_000));
        h.feed(fix(0.001, T0 + 4_000));
        // Dropping the harness shuts the engine down without finalizing
        trip_id
    };

    let store = reopen(&db_path);
    assert_eq!(store.get_active_trip().unwrap().map(|t| t.id), Some(trip_id));

    let h = Harness::new(store.clone(), TrackingConfig::default());
    assert!(matches!(h.engine.recovery(), Recovery::Finalized(s) if s.end_time_ms == T0 + 4_000));
    assert_eq!(store.list_trips().unwrap().len(), 1);
    assert!(!store.list_trips().unwrap()[0].is_active);
}

#[test]
fn test_clean_start() {
    let tmp_dir = TempDir::new().unwrap();
    let db_path = tmp_dir.path().join("trips.db").to_string_lossy().to_string();

    let h = Harness::new(reopen(&db_path), TrackingConfig::default());
    assert_eq!(h.engine.recovery(), &Recovery::Clean);
    assert_eq!(h.engine.state(), TrackingState::Idle);
}
