//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use trip_tracker::{
    FixSink, GpsFix, LocationRequest, LocationSource, ManualClock, PushLocationSource, Result,
    SqliteTripStore, SubscriptionHandle, TrackerError, TrackingConfig, TrackingEngine, Trip,
    TripId, TripStore,
};

/// 2023-11-14T22:13:20Z
pub const T0: i64 = 1_700_000_000_000;

/// Distance of 0.001 degrees of longitude along the equator.
pub const MILLI_DEGREE_KM: f64 = 0.111_195;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn fix(lng: f64, t: i64) -> GpsFix {
    GpsFix::new(0.0, lng, t).with_accuracy(5.0)
}

pub struct Harness {
    pub engine: TrackingEngine,
    pub source: PushLocationSource,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(store: Arc<dyn TripStore>, config: TrackingConfig) -> Self {
        init_logger();
        let source = PushLocationSource::new();
        let clock = Arc::new(ManualClock::new(T0));
        let engine = TrackingEngine::with_clock(
            store,
            Box::new(source.clone()),
            config,
            clock.clone(),
        )
        .expect("engine");
        Self {
            engine,
            source,
            clock,
        }
    }

    /// Move the clock to the fix time, push it, and wait until it is processed.
    pub fn feed(&self, fix: GpsFix) {
        self.clock.set(fix.timestamp_ms);
        self.source.push(fix);
        self.engine.flush().expect("flush");
    }
}

pub fn sqlite() -> Arc<SqliteTripStore> {
    Arc::new(SqliteTripStore::in_memory().expect("in-memory store"))
}

/// Wraps a store and fails selected operations on demand.
pub struct FlakyStore {
    inner: SqliteTripStore,
    pub fail_create: AtomicBool,
    pub fail_append: AtomicBool,
    pub fail_finalize: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteTripStore::in_memory().expect("in-memory store"),
            fail_create: AtomicBool::new(false),
            fail_append: AtomicBool::new(false),
            fail_finalize: AtomicBool::new(false),
        })
    }

    fn check(flag: &AtomicBool, op: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(TrackerError::storage(format!("injected {} failure", op)))
        } else {
            Ok(())
        }
    }
}

impl TripStore for FlakyStore {
    fn create_trip(&self, start_time_ms: i64) -> Result<TripId> {
        Self::check(&self.fail_create, "create")?;
        self.inner.create_trip(start_time_ms)
    }

    fn finalize_trip(
        &self,
        trip_id: TripId,
        end_time_ms: i64,
        total_distance_km: f64,
        duration_ms: i64,
    ) -> Result<()> {
        Self::check(&self.fail_finalize, "finalize")?;
        self.inner
            .finalize_trip(trip_id, end_time_ms, total_distance_km, duration_ms)
    }

    fn append_fix(&self, trip_id: TripId, fix: &GpsFix) -> Result<()> {
        Self::check(&self.fail_append, "append")?;
        self.inner.append_fix(trip_id, fix)
    }

    fn get_active_trip(&self) -> Result<Option<Trip>> {
        self.inner.get_active_trip()
    }

    fn get_trip_by_id(&self, trip_id: TripId) -> Result<Option<Trip>> {
        self.inner.get_trip_by_id(trip_id)
    }

    fn list_trips(&self) -> Result<Vec<Trip>> {
        self.inner.list_trips()
    }

    fn delete_trip(&self, trip_id: TripId) -> Result<()> {
        self.inner.delete_trip(trip_id)
    }

    fn rename_trip(&self, trip_id: TripId, name: Option<&str>) -> Result<()> {
        self.inner.rename_trip(trip_id, name)
    }

    fn count_fixes(&self, trip_id: TripId) -> Result<u32> {
        self.inner.count_fixes(trip_id)
    }

    fn last_fix(&self, trip_id: TripId) -> Result<Option<GpsFix>> {
        self.inner.last_fix(trip_id)
    }

    fn subscribe(&self) -> Option<watch::Receiver<u64>> {
        self.inner.subscribe()
    }
}

/// A source that keeps every sink it was given, even after `stop`, the way
/// a platform callback can still fire after unsubscribing.
#[derive(Clone, Default)]
pub struct LaggySource {
    pub sinks: Arc<Mutex<Vec<FixSink>>>,
}

impl LaggySource {
    pub fn deliver_to(&self, index: usize, fix: GpsFix) -> bool {
        let sinks = self.sinks.lock().unwrap();
        sinks[index].deliver(fix)
    }
}

impl LocationSource for LaggySource {
    fn start(&mut self, sink: FixSink, _request: &LocationRequest) -> Result<SubscriptionHandle> {
        let mut sinks = self.sinks.lock().unwrap();
        sinks.push(sink);
        Ok(SubscriptionHandle(sinks.len() as u64))
    }

    fn stop(&mut self, _handle: SubscriptionHandle) {}
}
