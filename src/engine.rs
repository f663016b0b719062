//! # Tracking Engine
//!
//! The trip lifecycle state machine (`Idle` -> `Active` -> `Idle`).
//!
//! ## Architecture
//!
//! All state transitions run on one worker thread that drains a FIFO mailbox:
//! - start / stop / history edit commands from the host (UI, notification)
//! - fixes delivered by the [`LocationSource`] through a [`FixSink`]
//!
//! Because there is exactly one consumer, the check-then-create of a new
//! trip is atomic, fixes are persisted in arrival order, and a slow store
//! write delays the next fix instead of reordering or dropping it.
//!
//! The current [`TrackingState`] is published on a `tokio::sync::watch`
//! channel: every observer sees the latest snapshot, late subscribers
//! included, and snapshots are never mutated in place.
//!
//! ## Failure policy
//!
//! - Trip creation and finalization failures propagate to the caller and
//!   leave the state machine where it was.
//! - A fix that cannot be written still advances the in-memory totals; the
//!   gap is reported as `unsaved_points` on the published state. After
//!   `max_consecutive_write_failures` failed writes in a row the engine stops
//!   the trip itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::watch;

use crate::filter::{FixDecision, FixFilter, RejectReason};
use crate::location::{FixSink, LocationSource, SubscriptionHandle};
use crate::store::TripStore;
use crate::{
    Clock, GpsFix, OrphanPolicy, Result, SystemClock, TrackerError, TrackingConfig,
    TrackingState, Trip, TripId, TripSummary,
};

// ============================================================================
// Public Types
// ============================================================================

/// Result of a start command.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum StartOutcome {
    Started(TripId),
    /// A trip was already being tracked; nothing changed
    AlreadyActive(TripId),
}

/// Result of a stop command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StopOutcome {
    Stopped(TripSummary),
    /// Nothing was being tracked; nothing changed
    AlreadyIdle,
}

/// What the engine found in storage when it was created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Recovery {
    /// No trip was left active
    Clean,
    /// An orphaned trip was closed out from its persisted fixes
    Finalized(TripSummary),
    /// An orphaned trip was picked up again and is being tracked
    Resumed {
        trip_id: TripId,
        distance_km: f64,
        points_count: u32,
    },
}

/// Counters for fixes and failures since the engine was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EngineStats {
    pub accepted_fixes: u64,
    /// Discarded by the accuracy gate
    pub low_quality_fixes: u64,
    /// Discarded for non-finite or out-of-range coordinates
    pub invalid_fixes: u64,
    /// Arrived for a trip that is no longer being tracked
    pub stale_fixes: u64,
    pub persistence_failures: u64,
    /// Trips the engine stopped itself after repeated write failures
    pub degraded_stops: u64,
}

#[derive(Debug, Default)]
struct EngineCounters {
    accepted_fixes: AtomicU64,
    low_quality_fixes: AtomicU64,
    invalid_fixes: AtomicU64,
    stale_fixes: AtomicU64,
    persistence_failures: AtomicU64,
    degraded_stops: AtomicU64,
}

impl EngineCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            accepted_fixes: self.accepted_fixes.load(Ordering::Relaxed),
            low_quality_fixes: self.low_quality_fixes.load(Ordering::Relaxed),
            invalid_fixes: self.invalid_fixes.load(Ordering::Relaxed),
            stale_fixes: self.stale_fixes.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            degraded_stops: self.degraded_stops.load(Ordering::Relaxed),
        }
    }
}

/// Pending reply to a command sent to the engine worker.
pub struct CommandHandle<T> {
    receiver: Receiver<Result<T>>,
}

impl<T> CommandHandle<T> {
    /// Check if the command has completed (non-blocking).
    pub fn try_recv(&self) -> Option<Result<T>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(TrackerError::EngineStopped)),
        }
    }

    /// Wait up to `timeout` for the command to complete.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => Some(Err(TrackerError::EngineStopped)),
        }
    }

    /// Wait for the command to complete (blocking).
    pub fn recv(self) -> Result<T> {
        self.receiver
            .recv()
            .unwrap_or(Err(TrackerError::EngineStopped))
    }
}

/// Mailbox entries processed by the worker, in arrival order.
#[derive(Debug)]
pub(crate) enum Message {
    Start(Sender<Result<StartOutcome>>),
    Stop(Sender<Result<StopOutcome>>),
    DeleteTrip(TripId, Sender<Result<()>>),
    RenameTrip(TripId, Option<String>, Sender<Result<()>>),
    Flush(Sender<Result<()>>),
    Fix { trip_id: TripId, fix: GpsFix },
    Shutdown,
}

// ============================================================================
// Tracking Engine
// ============================================================================

/// Handle to the tracking engine.
///
/// Cheap to share behind an `Arc`; every method only enqueues a message or
/// reads published state.
pub struct TrackingEngine {
    mailbox: Sender<Message>,
    state: watch::Receiver<TrackingState>,
    counters: Arc<EngineCounters>,
    recovery: Recovery,
    worker: Option<JoinHandle<()>>,
}

impl TrackingEngine {
    /// Create an engine using the system clock.
    ///
    /// Before returning, storage is checked for a trip left active by a
    /// previous process and the configured [`OrphanPolicy`] is applied; see
    /// [`TrackingEngine::recovery`].
    pub fn new(
        store: Arc<dyn TripStore>,
        source: Box<dyn LocationSource>,
        config: TrackingConfig,
    ) -> Result<Self> {
        Self::with_clock(store, source, config, Arc::new(SystemClock))
    }

    /// Create an engine with an explicit clock.
    pub fn with_clock(
        store: Arc<dyn TripStore>,
        source: Box<dyn LocationSource>,
        config: TrackingConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let (mailbox, inbox) = mpsc::channel();
        let (publisher, state) = watch::channel(TrackingState::Idle);
        let counters = Arc::new(EngineCounters::default());

        let mut core = EngineCore {
            filter: FixFilter::from_config(&config),
            store,
            source,
            clock,
            config,
            mailbox: mailbox.clone(),
            publisher,
            counters: Arc::clone(&counters),
            session: None,
            abandoned: None,
        };
        let recovery = core.recover()?;

        let worker = thread::Builder::new()
            .name("trip-tracker-engine".to_string())
            .spawn(move || core.run(inbox))
            .map_err(|e| TrackerError::Internal {
                message: format!("failed to spawn engine worker: {}", e),
            })?;

        Ok(Self {
            mailbox,
            state,
            counters,
            recovery,
            worker: Some(worker),
        })
    }

    fn send<T>(&self, build: impl FnOnce(Sender<Result<T>>) -> Message) -> CommandHandle<T> {
        let (reply, receiver) = mpsc::channel();
        // A failed send drops `reply`, which the handle reports as EngineStopped
        let _ = self.mailbox.send(build(reply));
        CommandHandle { receiver }
    }

    /// Queue a start command without waiting for the trip to be created.
    pub fn request_start(&self) -> CommandHandle<StartOutcome> {
        self.send(Message::Start)
    }

    /// Start tracking a new trip. Starting while active is a no-op.
    pub fn start(&self) -> Result<StartOutcome> {
        self.request_start().recv()
    }

    /// Queue a stop command without waiting for the trip to be finalized.
    pub fn request_stop(&self) -> CommandHandle<StopOutcome> {
        self.send(Message::Stop)
    }

    /// Stop tracking and finalize the trip. Stopping while idle is a no-op.
    pub fn stop(&self) -> Result<StopOutcome> {
        self.request_stop().recv()
    }

    /// Delete a trip from history. The trip being tracked cannot be deleted.
    pub fn delete_trip(&self, trip_id: TripId) -> Result<()> {
        self.send(|reply| Message::DeleteTrip(trip_id, reply)).recv()
    }

    /// Set or clear a trip's name.
    pub fn rename_trip(&self, trip_id: TripId, name: Option<&str>) -> Result<()> {
        let name = name.map(str::to_string);
        self.send(|reply| Message::RenameTrip(trip_id, name, reply)).recv()
    }

    /// Wait until every message queued before this call has been processed.
    pub fn flush(&self) -> Result<()> {
        self.send(Message::Flush).recv()
    }

    /// Latest published state.
    pub fn state(&self) -> TrackingState {
        self.state.borrow().clone()
    }

    /// Subscribe to state changes. The receiver starts at the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<TrackingState> {
        self.state.clone()
    }

    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    /// Outcome of the orphaned-trip check done at creation.
    pub fn recovery(&self) -> &Recovery {
        &self.recovery
    }

    /// Stop the worker. An active trip is unsubscribed but left active in
    /// storage, exactly as if the process had been killed.
    pub fn shutdown(mut self) {
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.mailbox.send(Message::Shutdown);
            if worker.join().is_err() {
                error!("[TrackingEngine] Worker thread panicked");
            }
        }
    }
}

impl Drop for TrackingEngine {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

// ============================================================================
// Accumulator
// ============================================================================

/// Running totals for the active trip.
#[derive(Debug, Clone, Default, PartialEq)]
struct Accumulator {
    last_fix: Option<GpsFix>,
    total_distance_km: f64,
    points_count: u32,
    unsaved_points: u32,
    consecutive_failures: u32,
    duration_ms: i64,
}

impl Accumulator {
    /// Rebuild totals from already-accepted fixes.
    fn replay(filter: &FixFilter, fixes: &[GpsFix]) -> Self {
        let mut acc = Self::default();
        for fix in fixes {
            let distance_km = filter.movement_contribution(acc.last_fix.as_ref(), fix);
            acc.record(*fix, distance_km);
        }
        acc
    }

    fn record(&mut self, fix: GpsFix, distance_km: f64) {
        self.total_distance_km += distance_km;
        self.points_count = self.points_count.saturating_add(1);
        self.last_fix = Some(fix);
    }

    /// Durations never go backwards, even if the wall clock does.
    fn update_duration(&mut self, elapsed_ms: i64) {
        self.duration_ms = self.duration_ms.max(elapsed_ms);
    }
}

struct ActiveSession {
    trip_id: TripId,
    start_time_ms: i64,
    subscription: SubscriptionHandle,
    acc: Accumulator,
}

impl ActiveSession {
    fn snapshot(&self) -> TrackingState {
        TrackingState::Active {
            trip_id: self.trip_id,
            current_distance_km: self.acc.total_distance_km,
            current_duration_ms: self.acc.duration_ms,
            points_count: self.acc.points_count,
            unsaved_points: self.acc.unsaved_points,
        }
    }

    fn summary(&self, end_time_ms: i64) -> TripSummary {
        let end_time_ms = end_time_ms.max(self.start_time_ms);
        TripSummary {
            trip_id: self.trip_id,
            start_time_ms: self.start_time_ms,
            end_time_ms,
            distance_km: self.acc.total_distance_km,
            duration_ms: (end_time_ms - self.start_time_ms).max(self.acc.duration_ms),
            points_count: self.acc.points_count,
            unsaved_points: self.acc.unsaved_points,
        }
    }
}

// ============================================================================
// Engine Core (worker thread)
// ============================================================================

struct EngineCore {
    store: Arc<dyn TripStore>,
    source: Box<dyn LocationSource>,
    clock: Arc<dyn Clock>,
    config: TrackingConfig,
    filter: FixFilter,
    mailbox: Sender<Message>,
    publisher: watch::Sender<TrackingState>,
    counters: Arc<EngineCounters>,
    session: Option<ActiveSession>,
    /// Trip given up by a degraded stop whose finalize also failed
    abandoned: Option<TripSummary>,
}

impl EngineCore {
    fn run(mut self, inbox: Receiver<Message>) {
        info!("[TrackingEngine] Worker started");

        while let Ok(message) = inbox.recv() {
            match message {
                Message::Start(reply) => {
                    let _ = reply.send(self.start());
                }
                Message::Stop(reply) => {
                    let _ = reply.send(self.stop());
                }
                Message::DeleteTrip(trip_id, reply) => {
                    let _ = reply.send(self.delete_trip(trip_id));
                }
                Message::RenameTrip(trip_id, name, reply) => {
                    let _ = reply.send(self.store.rename_trip(trip_id, name.as_deref()));
                }
                Message::Flush(reply) => {
                    let _ = reply.send(Ok(()));
                }
                Message::Fix { trip_id, fix } => self.on_fix(trip_id, fix),
                Message::Shutdown => {
                    self.shutdown();
                    break;
                }
            }
        }

        info!("[TrackingEngine] Worker stopped");
    }

    fn publish(&self) {
        let state = match &self.session {
            Some(session) => session.snapshot(),
            None => TrackingState::Idle,
        };
        self.publisher.send_replace(state);
    }

    fn subscribe_source(&mut self, trip_id: TripId) -> Result<SubscriptionHandle> {
        let sink = FixSink::new(trip_id, self.mailbox.clone());
        self.source.start(sink, &self.config.location_request())
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn start(&mut self) -> Result<StartOutcome> {
        if let Some(session) = &self.session {
            debug!(
                "[TrackingEngine] Start ignored, trip {} already active",
                session.trip_id
            );
            return Ok(StartOutcome::AlreadyActive(session.trip_id));
        }

        self.source.check_permission()?;
        self.finalize_abandoned()?;

        if let Some(existing) = self.store.get_active_trip()? {
            warn!(
                "[TrackingEngine] Refusing to start: trip {} is still active in storage",
                existing.id
            );
            return Err(TrackerError::OrphanedTrip {
                trip_id: existing.id,
            });
        }

        let start_time_ms = self.clock.now_ms();
        let trip_id = self.store.create_trip(start_time_ms)?;

        let subscription = match self.subscribe_source(trip_id) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    "[TrackingEngine] Location source failed for trip {}: {}",
                    trip_id, e
                );
                if let Err(cleanup) = self.store.delete_trip(trip_id) {
                    error!(
                        "[TrackingEngine] Could not remove trip {} after failed start: {}",
                        trip_id, cleanup
                    );
                }
                return Err(e);
            }
        };

        self.session = Some(ActiveSession {
            trip_id,
            start_time_ms,
            subscription,
            acc: Accumulator::default(),
        });
        info!("[TrackingEngine] Trip {} started", trip_id);
        self.publish();

        Ok(StartOutcome::Started(trip_id))
    }

    fn stop(&mut self) -> Result<StopOutcome> {
        let Some(session) = self.session.take() else {
            debug!("[TrackingEngine] Stop ignored, no active trip");
            return Ok(StopOutcome::AlreadyIdle);
        };

        let summary = session.summary(self.clock.now_ms());
        if let Err(e) = self.store.finalize_trip(
            summary.trip_id,
            summary.end_time_ms,
            summary.distance_km,
            summary.duration_ms,
        ) {
            error!(
                "[TrackingEngine] Failed to finalize trip {}, still tracking: {}",
                summary.trip_id, e
            );
            self.session = Some(session);
            return Err(e);
        }

        self.source.stop(session.subscription);
        self.publish();
        info!(
            "[TrackingEngine] Trip {} ended - Distance: {:.2}km, Duration: {}ms, Points: {}",
            summary.trip_id, summary.distance_km, summary.duration_ms, summary.points_count
        );

        Ok(StopOutcome::Stopped(summary))
    }

    /// Retry the finalize of a trip left active by a degraded stop.
    fn finalize_abandoned(&mut self) -> Result<()> {
        let Some(summary) = self.abandoned.take() else {
            return Ok(());
        };

        let still_active = self
            .store
            .get_trip_by_id(summary.trip_id)
            .map(|trip| trip.is_some_and(|t| t.is_active));
        match still_active {
            Ok(false) => return Ok(()),
            Ok(true) => {}
            Err(e) => {
                self.abandoned = Some(summary);
                return Err(e);
            }
        }

        if let Err(e) = self.store.finalize_trip(
            summary.trip_id,
            summary.end_time_ms,
            summary.distance_km,
            summary.duration_ms,
        ) {
            warn!(
                "[TrackingEngine] Trip {} still cannot be finalized: {}",
                summary.trip_id, e
            );
            self.abandoned = Some(summary);
            return Err(e);
        }
        info!(
            "[TrackingEngine] Finalized abandoned trip {} - Distance: {:.2}km",
            summary.trip_id, summary.distance_km
        );
        Ok(())
    }

    fn delete_trip(&mut self, trip_id: TripId) -> Result<()> {
        if self.session.as_ref().is_some_and(|s| s.trip_id == trip_id) {
            return Err(TrackerError::TripActive { trip_id });
        }
        self.store.delete_trip(trip_id)?;
        if self.abandoned.as_ref().is_some_and(|s| s.trip_id == trip_id) {
            self.abandoned = None;
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            self.source.stop(session.subscription);
            info!(
                "[TrackingEngine] Shut down while tracking trip {}; left active for recovery",
                session.trip_id
            );
        }
        self.publish();
    }

    // ------------------------------------------------------------------------
    // Fixes
    // ------------------------------------------------------------------------

    fn on_fix(&mut self, trip_id: TripId, fix: GpsFix) {
        let Some(session) = self.session.as_mut().filter(|s| s.trip_id == trip_id) else {
            EngineCounters::bump(&self.counters.stale_fixes);
            debug!("[TrackingEngine] Discarding fix for inactive trip {}", trip_id);
            return;
        };

        let distance_km = match self.filter.evaluate(session.acc.last_fix.as_ref(), &fix) {
            FixDecision::Accepted { distance_km } => distance_km,
            FixDecision::Rejected(RejectReason::LowAccuracy(accuracy)) => {
                EngineCounters::bump(&self.counters.low_quality_fixes);
                debug!(
                    "[TrackingEngine] Location accuracy too low: {}m, skipping",
                    accuracy
                );
                return;
            }
            FixDecision::Rejected(RejectReason::InvalidCoordinate) => {
                EngineCounters::bump(&self.counters.invalid_fixes);
                debug!(
                    "[TrackingEngine] Invalid coordinate ({}, {}), skipping",
                    fix.latitude, fix.longitude
                );
                return;
            }
        };

        match self.store.append_fix(trip_id, &fix) {
            Ok(()) => session.acc.consecutive_failures = 0,
            Err(e) => {
                session.acc.unsaved_points = session.acc.unsaved_points.saturating_add(1);
                session.acc.consecutive_failures += 1;
                EngineCounters::bump(&self.counters.persistence_failures);
                warn!(
                    "[TrackingEngine] Fix not persisted for trip {} ({} unsaved): {}",
                    trip_id, session.acc.unsaved_points, e
                );
            }
        }

        session.acc.record(fix, distance_km);
        session
            .acc
            .update_duration(self.clock.now_ms() - session.start_time_ms);
        EngineCounters::bump(&self.counters.accepted_fixes);

        debug!(
            "[TrackingEngine] Fix processed: ({}, {}), +{:.3}km, Total: {:.2}km, Points: {}",
            fix.latitude,
            fix.longitude,
            distance_km,
            session.acc.total_distance_km,
            session.acc.points_count
        );

        let exhausted =
            session.acc.consecutive_failures >= self.config.max_consecutive_write_failures;
        self.publish();

        if exhausted {
            self.degrade();
        }
    }

    /// Give up on a trip whose fixes keep failing to persist.
    fn degrade(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        error!(
            "[TrackingEngine] {} consecutive write failures, stopping trip {}",
            session.acc.consecutive_failures, session.trip_id
        );

        let summary = session.summary(self.clock.now_ms());
        if let Err(e) = self.store.finalize_trip(
            summary.trip_id,
            summary.end_time_ms,
            summary.distance_km,
            summary.duration_ms,
        ) {
            error!(
                "[TrackingEngine] Could not finalize trip {}; retrying on next start: {}",
                summary.trip_id, e
            );
            self.abandoned = Some(summary);
        }

        self.source.stop(session.subscription);
        EngineCounters::bump(&self.counters.degraded_stops);
        self.publish();
    }

    // ------------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------------

    fn recover(&mut self) -> Result<Recovery> {
        let Some(trip) = self.store.get_active_trip()? else {
            return Ok(Recovery::Clean);
        };
        warn!(
            "[TrackingEngine] Found orphaned trip {} with {} points ({:?} policy)",
            trip.id,
            trip.fixes.len(),
            self.config.orphan_policy
        );

        let acc = Accumulator::replay(&self.filter, &trip.fixes);

        if self.config.orphan_policy == OrphanPolicy::Resume {
            match self.resume(&trip, acc.clone()) {
                Ok(()) => {
                    info!("[TrackingEngine] Resumed trip {}", trip.id);
                    return Ok(Recovery::Resumed {
                        trip_id: trip.id,
                        distance_km: acc.total_distance_km,
                        points_count: acc.points_count,
                    });
                }
                Err(e) => warn!(
                    "[TrackingEngine] Could not resume trip {}, finalizing instead: {}",
                    trip.id, e
                ),
            }
        }

        let end_time_ms = acc
            .last_fix
            .map(|fix| fix.timestamp_ms)
            .unwrap_or(trip.start_time_ms)
            .max(trip.start_time_ms);
        let summary = TripSummary {
            trip_id: trip.id,
            start_time_ms: trip.start_time_ms,
            end_time_ms,
            distance_km: acc.total_distance_km,
            duration_ms: end_time_ms - trip.start_time_ms,
            points_count: acc.points_count,
            unsaved_points: 0,
        };
        self.store.finalize_trip(
            summary.trip_id,
            summary.end_time_ms,
            summary.distance_km,
            summary.duration_ms,
        )?;
        info!(
            "[TrackingEngine] Finalized orphaned trip {} - Distance: {:.2}km, Points: {}",
            summary.trip_id, summary.distance_km, summary.points_count
        );

        Ok(Recovery::Finalized(summary))
    }

    fn resume(&mut self, trip: &Trip, mut acc: Accumulator) -> Result<()> {
        self.source.check_permission()?;
        let subscription = self.subscribe_source(trip.id)?;
        acc.update_duration(self.clock.now_ms() - trip.start_time_ms);

        self.session = Some(ActiveSession {
            trip_id: trip.id,
            start_time_ms: trip.start_time_ms,
            subscription,
            acc,
        });
        self.publish();
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
