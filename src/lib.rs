//! # Trip Tracker
//!
//! Trip tracking state machine and distance accumulation for mobile apps.
//!
//! This library provides:
//! - Great-circle distance between GPS fixes (haversine, 6371 km sphere)
//! - Accuracy and movement filtering of raw location fixes
//! - A single-writer tracking engine that owns the active trip and publishes
//!   its state to any number of observers
//! - SQLite persistence of trips and their fixes
//!
//! ## Features
//!
//! - **`persistence`** - SQLite trip store (enabled by default)
//! - **`ffi`** - FFI bindings for mobile platforms (iOS/Android)
//!
//! ## Quick Start
//!
//! ```rust
//! use trip_tracker::{Coordinate, geo_utils::distance_km};
//!
//! let a = Coordinate::new(0.0, 0.0);
//! let b = Coordinate::new(0.0, 1.0);
//! let d = distance_km(a, b);
//! assert!((d - 111.19).abs() < 0.5);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

// Unified error handling
pub mod error;
pub use error::{Result, TrackerError};

// Haversine distance
pub mod geo_utils;

// Accuracy and movement gates
pub mod filter;
pub use filter::{FixDecision, FixFilter, RejectReason};

// Wall clock abstraction
pub mod clock;
pub use clock::{Clock, ManualClock, SystemClock};

// Location source boundary
pub mod location;
pub use location::{
    FixSink, LocationRequest, LocationSource, PushLocationSource, SubscriptionHandle,
};

// Trip storage boundary and SQLite adapter
pub mod store;
#[cfg(feature = "persistence")]
pub use store::sqlite::SqliteTripStore;
pub use store::TripStore;

// Tracking state machine
pub mod engine;
pub use engine::{
    CommandHandle, EngineStats, Recovery, StartOutcome, StopOutcome, TrackingEngine,
};

// Observer-side route polling
pub mod monitor;
pub use monitor::{RouteMonitor, RouteSnapshot};

// Display formatting
pub mod format;

// FFI bindings for mobile platforms (iOS/Android)
#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("triptracker"),
    );
}

#[cfg(not(target_os = "android"))]
pub fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the coordinate is finite and inside the valid lat/lng ranges.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// One raw location reading.
///
/// Produced by a [`LocationSource`], consumed once by the engine and stored
/// verbatim when accepted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Wall-clock milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    /// Reported error radius in meters
    pub accuracy_m: Option<f64>,
}

impl GpsFix {
    pub fn new(latitude: f64, longitude: f64, timestamp_ms: i64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp_ms,
            accuracy_m: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy_m: f64) -> Self {
        self.accuracy_m = Some(accuracy_m);
        self
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// Storage-assigned trip identifier. Increases with creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TripId(pub i64);

impl fmt::Display for TripId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One tracked journey as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub id: TripId,
    pub start_time_ms: i64,
    /// None while the trip is active
    pub end_time_ms: Option<i64>,
    pub total_distance_km: f64,
    /// Frozen at finalization; 0 while active (use [`Trip::duration_at`])
    pub duration_ms: i64,
    pub is_active: bool,
    pub name: Option<String>,
    /// Number of stored fixes
    pub point_count: u32,
    /// Stored fixes in chronological order. Empty in list views.
    pub fixes: Vec<GpsFix>,
}

impl Trip {
    /// Duration as seen at `now_ms`: elapsed time while active, the frozen value after.
    pub fn duration_at(&self, now_ms: i64) -> i64 {
        if self.is_active {
            (now_ms - self.start_time_ms).max(0)
        } else {
            self.duration_ms
        }
    }
}

/// Published tracking snapshot.
///
/// Observers only ever receive fresh values; nothing is mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrackingState {
    Idle,
    Active {
        trip_id: TripId,
        current_distance_km: f64,
        current_duration_ms: i64,
        points_count: u32,
        /// Accepted fixes that could not be written to storage
        unsaved_points: u32,
    },
}

impl TrackingState {
    pub fn is_active(&self) -> bool {
        matches!(self, TrackingState::Active { .. })
    }

    pub fn trip_id(&self) -> Option<TripId> {
        match self {
            TrackingState::Idle => None,
            TrackingState::Active { trip_id, .. } => Some(*trip_id),
        }
    }
}

/// Final figures of a trip closed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripSummary {
    pub trip_id: TripId,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub distance_km: f64,
    pub duration_ms: i64,
    pub points_count: u32,
    pub unsaved_points: u32,
}

// ============================================================================
// Configuration
// ============================================================================

/// What to do with a trip still marked active when the engine starts up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Close the trip out with whatever was persisted
    #[default]
    Finalize,
    /// Rebuild the accumulator from persisted fixes and keep tracking
    Resume,
}

/// Tunables for the tracking engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Desired interval between location updates.
    /// Default: 5000 ms
    pub update_interval_ms: u64,

    /// Fastest interval the source may deliver at.
    /// Default: 3000 ms
    pub fastest_update_interval_ms: u64,

    /// Movement threshold: displacements at or below this contribute no distance.
    /// Also passed to the source as its minimum update distance.
    /// Default: 5.0 meters
    pub min_distance_m: f64,

    /// Accuracy gate: fixes reporting a larger error radius are discarded.
    /// Default: 20.0 meters
    pub min_accuracy_m: f64,

    /// Consecutive fix write failures before the engine gives up on the trip.
    /// Default: 10
    pub max_consecutive_write_failures: u32,

    /// Handling of a trip left active by a previous process.
    /// Default: finalize
    pub orphan_policy: OrphanPolicy,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 5000,
            fastest_update_interval_ms: 3000,
            min_distance_m: 5.0,
            min_accuracy_m: 20.0,
            max_consecutive_write_failures: 10,
            orphan_policy: OrphanPolicy::Finalize,
        }
    }
}

impl TrackingConfig {
    /// Parse a (possibly partial) JSON config; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| TrackerError::ConfigError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(TrackerError::ConfigError {
                message: message.to_string(),
            })
        };

        if self.update_interval_ms == 0 {
            return invalid("update_interval_ms must be positive");
        }
        if self.fastest_update_interval_ms > self.update_interval_ms {
            return invalid("fastest_update_interval_ms exceeds update_interval_ms");
        }
        if !self.min_distance_m.is_finite() || self.min_distance_m < 0.0 {
            return invalid("min_distance_m must be a non-negative number");
        }
        if !self.min_accuracy_m.is_finite() || self.min_accuracy_m < 0.0 {
            return invalid("min_accuracy_m must be a non-negative number");
        }
        if self.max_consecutive_write_failures == 0 {
            return invalid("max_consecutive_write_failures must be positive");
        }
        Ok(())
    }

    /// Sampling request handed to the location source.
    pub fn location_request(&self) -> LocationRequest {
        LocationRequest {
            desired_interval_ms: self.update_interval_ms,
            fastest_interval_ms: self.fastest_update_interval_ms,
            min_distance_m: self.min_distance_m,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
