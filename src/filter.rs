//! Fix filtering.
//!
//! Two gates run in order on every fix that arrives during an active trip:
//!
//! 1. **Accuracy gate** - fixes whose reported error radius exceeds
//!    `min_accuracy_m` are discarded outright.
//! 2. **Movement gate** - an accepted fix only contributes distance when it is
//!    more than `min_distance_m` away from the previous accepted fix. Fixes
//!    under the threshold are still stored and counted, which keeps sampling
//!    density without letting stationary drift inflate the total.

use crate::geo_utils::distance_km;
use crate::{GpsFix, TrackingConfig};

/// Why a fix was discarded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RejectReason {
    /// Reported accuracy (meters) above the threshold
    LowAccuracy(f64),
    /// Non-finite or out-of-range coordinates
    InvalidCoordinate,
}

/// Verdict for a single fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FixDecision {
    Rejected(RejectReason),
    /// Accepted; `distance_km` is what the fix adds to the trip total
    /// (0 for the first fix and for sub-threshold movement).
    Accepted { distance_km: f64 },
}

impl FixDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FixDecision::Accepted { .. })
    }
}

/// Stateless fix filter. The caller owns the "last accepted fix" reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixFilter {
    pub min_accuracy_m: f64,
    pub min_distance_m: f64,
}

impl Default for FixFilter {
    fn default() -> Self {
        Self::from_config(&TrackingConfig::default())
    }
}

impl FixFilter {
    pub fn from_config(config: &TrackingConfig) -> Self {
        Self {
            min_accuracy_m: config.min_accuracy_m,
            min_distance_m: config.min_distance_m,
        }
    }

    /// Accuracy gate. Fixes without a reported accuracy pass.
    pub fn passes_accuracy(&self, fix: &GpsFix) -> bool {
        match fix.accuracy_m {
            Some(accuracy) => accuracy <= self.min_accuracy_m,
            None => true,
        }
    }

    /// Distance `fix` adds relative to `last`, after the movement gate.
    pub fn movement_contribution(&self, last: Option<&GpsFix>, fix: &GpsFix) -> f64 {
        let Some(last) = last else {
            return 0.0;
        };
        let distance = distance_km(last.coordinate(), fix.coordinate());
        if distance * 1000.0 > self.min_distance_m {
            distance
        } else {
            0.0
        }
    }

    /// Run both gates.
    pub fn evaluate(&self, last: Option<&GpsFix>, fix: &GpsFix) -> FixDecision {
        if !fix.coordinate().is_valid() {
            return FixDecision::Rejected(RejectReason::InvalidCoordinate);
        }
        if !self.passes_accuracy(fix) {
            return FixDecision::Rejected(RejectReason::LowAccuracy(
                fix.accuracy_m.unwrap_or(f64::NAN),
            ));
        }
        FixDecision::Accepted {
            distance_km: self.movement_contribution(last, fix),
        }
    }
}
