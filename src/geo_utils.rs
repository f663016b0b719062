//! Geographic utilities.

use crate::Coordinate;

/// Mean Earth radius used for all distances, in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two coordinates in kilometers (haversine).
///
/// Total over all inputs, symmetric, and exactly 0 for identical points.
///
/// # Example
/// ```
/// use trip_tracker::{Coordinate, geo_utils::distance_km};
///
/// let d = distance_km(Coordinate::new(0.0, 0.0), Coordinate::new(0.0, 0.001));
/// assert!((d - 0.1112).abs() < 0.001);
/// ```
pub fn distance_km(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlng = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    // Rounding can push h a hair outside [0, 1] for antipodal points
    let c = 2.0 * h.clamp(0.0, 1.0).sqrt().asin();

    EARTH_RADIUS_KM * c
}

/// Great-circle distance in meters.
pub fn distance_m(a: Coordinate, b: Coordinate) -> f64 {
    distance_km(a, b) * 1000.0
}
