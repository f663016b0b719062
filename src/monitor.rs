//! Observer-side route polling.
//!
//! Map screens want the full route of the trip in progress, which the
//! published [`TrackingState`] deliberately does not carry. A [`RouteMonitor`]
//! re-reads the active trip from the store on a fixed period and publishes a
//! [`RouteSnapshot`]. It runs on the observer's tokio runtime, independent of
//! the engine's event-driven updates, and stops when cancelled or dropped.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::store::TripStore;
use crate::{Clock, Coordinate, GpsFix, TrackingState, TripId};

/// Route of the trip in progress as last read from storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteSnapshot {
    pub trip_id: TripId,
    pub points: Vec<Coordinate>,
    pub duration_ms: i64,
}

/// Handle to a running route poller.
pub struct RouteMonitor {
    snapshots: watch::Receiver<Option<RouteSnapshot>>,
    task: JoinHandle<()>,
}

impl RouteMonitor {
    /// Start polling every `period`. Must be called within a tokio runtime.
    pub fn spawn(
        store: Arc<dyn TripStore>,
        state: watch::Receiver<TrackingState>,
        clock: Arc<dyn Clock>,
        period: Duration,
    ) -> Self {
        let (publisher, snapshots) = watch::channel(None);
        let task = tokio::spawn(poll_routes(store, state, clock, period, publisher));
        Self { snapshots, task }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<RouteSnapshot>> {
        self.snapshots.clone()
    }

    pub fn latest(&self) -> Option<RouteSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RouteMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn poll_routes(
    store: Arc<dyn TripStore>,
    state: watch::Receiver<TrackingState>,
    clock: Arc<dyn Clock>,
    period: Duration,
    publisher: watch::Sender<Option<RouteSnapshot>>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let engine_gone = state.has_changed().is_err();
        let trip_id = if engine_gone {
            None
        } else {
            state.borrow().trip_id()
        };

        let snapshot = match trip_id {
            None => None,
            Some(trip_id) => {
                let store = Arc::clone(&store);
                match tokio::task::spawn_blocking(move || store.get_trip_by_id(trip_id)).await {
                    Ok(Ok(Some(trip))) => Some(RouteSnapshot {
                        trip_id,
                        points: trip.fixes.iter().map(GpsFix::coordinate).collect(),
                        duration_ms: trip.duration_at(clock.now_ms()),
                    }),
                    Ok(Ok(None)) => None,
                    Ok(Err(e)) => {
                        warn!("[RouteMonitor] Failed to load trip {}: {}", trip_id, e);
                        continue;
                    }
                    Err(e) => {
                        warn!("[RouteMonitor] Route query task failed: {}", e);
                        continue;
                    }
                }
            }
        };

        publisher.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });

        if engine_gone {
            debug!("[RouteMonitor] Engine gone, stopping");
            break;
        }
    }
}
