//! Location source boundary.
//!
//! The engine never talks to a GPS driver directly. It asks a
//! [`LocationSource`] to start delivering fixes into a [`FixSink`] and to stop
//! again. Delivery is best-effort: sources may drop or slightly reorder fixes.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::engine::Message;
use crate::{GpsFix, Result, TrackerError, TripId};

/// Sampling parameters requested from the source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationRequest {
    pub desired_interval_ms: u64,
    pub fastest_interval_ms: u64,
    pub min_distance_m: f64,
}

/// Opaque token identifying one active subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// Where a source delivers fixes for one trip.
///
/// Every fix is tagged with the trip it was requested for, so fixes still in
/// flight when the trip stops are discarded instead of landing on a closed trip.
#[derive(Debug, Clone)]
pub struct FixSink {
    trip_id: TripId,
    mailbox: Sender<Message>,
}

impl FixSink {
    pub(crate) fn new(trip_id: TripId, mailbox: Sender<Message>) -> Self {
        Self { trip_id, mailbox }
    }

    pub fn trip_id(&self) -> TripId {
        self.trip_id
    }

    /// Queue a fix for processing. Returns false once the engine has shut down.
    pub fn deliver(&self, fix: GpsFix) -> bool {
        self.mailbox
            .send(Message::Fix {
                trip_id: self.trip_id,
                fix,
            })
            .is_ok()
    }
}

/// Producer of live location fixes, controlled by the tracking engine.
pub trait LocationSource: Send {
    /// Check that location access is granted. Called before a trip is created.
    fn check_permission(&self) -> Result<()> {
        Ok(())
    }

    /// Begin delivering fixes into `sink`.
    fn start(&mut self, sink: FixSink, request: &LocationRequest) -> Result<SubscriptionHandle>;

    /// Stop the subscription. Best effort; must not block on in-flight fixes.
    fn stop(&mut self, handle: SubscriptionHandle);
}

// ============================================================================
// Push Location Source
// ============================================================================

#[derive(Debug)]
struct PushState {
    permission_granted: bool,
    unavailable: Option<String>,
    next_handle: u64,
    subscription: Option<(SubscriptionHandle, FixSink)>,
    last_request: Option<LocationRequest>,
    start_count: u32,
    dropped: u64,
}

/// A source fed from outside: the host's sensor callback pushes fixes in.
///
/// Clones share the same state, so one clone can be handed to the engine
/// while the platform layer keeps another to push fixes and toggle permission.
#[derive(Debug, Clone)]
pub struct PushLocationSource {
    state: Arc<Mutex<PushState>>,
}

impl Default for PushLocationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PushLocationSource {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PushState {
                permission_granted: true,
                unavailable: None,
                next_handle: 1,
                subscription: None,
                last_request: None,
                start_count: 0,
                dropped: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PushState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_permission(&self, granted: bool) {
        self.lock().permission_granted = granted;
    }

    /// Make the next `start` calls fail (sensor off, provider missing).
    pub fn set_unavailable(&self, reason: Option<String>) {
        self.lock().unavailable = reason;
    }

    /// Forward a fix to the current subscriber. Returns false if nobody is
    /// subscribed or the engine is gone; such fixes are counted as dropped.
    pub fn push(&self, fix: GpsFix) -> bool {
        let mut state = self.lock();
        let delivered = match &state.subscription {
            Some((_, sink)) => sink.deliver(fix),
            None => false,
        };
        if !delivered {
            state.dropped += 1;
        }
        delivered
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock().subscription.is_some()
    }

    /// Trip the current subscription delivers to.
    pub fn subscribed_trip(&self) -> Option<TripId> {
        self.lock().subscription.as_ref().map(|(_, sink)| sink.trip_id())
    }

    pub fn last_request(&self) -> Option<LocationRequest> {
        self.lock().last_request
    }

    pub fn start_count(&self) -> u32 {
        self.lock().start_count
    }

    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }
}

impl LocationSource for PushLocationSource {
    fn check_permission(&self) -> Result<()> {
        if self.lock().permission_granted {
            Ok(())
        } else {
            Err(TrackerError::PermissionDenied)
        }
    }

    fn start(&mut self, sink: FixSink, request: &LocationRequest) -> Result<SubscriptionHandle> {
        let mut state = self.lock();
        if !state.permission_granted {
            return Err(TrackerError::PermissionDenied);
        }
        if let Some(reason) = &state.unavailable {
            return Err(TrackerError::LocationUnavailable {
                message: reason.clone(),
            });
        }

        let handle = SubscriptionHandle(state.next_handle);
        state.next_handle += 1;
        state.start_count += 1;
        state.last_request = Some(*request);
        info!(
            "[PushLocationSource] Subscribed trip {} ({} ms interval, {} ms fastest, {} m)",
            sink.trip_id(),
            request.desired_interval_ms,
            request.fastest_interval_ms,
            request.min_distance_m
        );
        state.subscription = Some((handle, sink));
        Ok(handle)
    }

    fn stop(&mut self, handle: SubscriptionHandle) {
        let mut state = self.lock();
        match &state.subscription {
            Some((current, _)) if *current == handle => {
                state.subscription = None;
                info!("[PushLocationSource] Unsubscribed");
            }
            _ => debug!("[PushLocationSource] Ignoring stop for stale handle {:?}", handle),
        }
    }
}
