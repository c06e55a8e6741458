//! # Geographic Utilities
//!
//! Pure geodesic helpers used by every other component of the engine.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`distance_km`] | Great-circle distance between two points |
//! | [`bearing_degrees`] | Initial bearing from one point to another |
//! | [`destination_point`] | Forward projection along a bearing |
//! | [`polyline_length_km`] | Total length of an ordered list of points |
//! | [`meters_to_degrees`] | Convert meters to approximate degrees at a latitude |
//!
//! ## Example
//!
//! ```rust
//! use ride_assist::{GpsPoint, geo_utils};
//!
//! let ningbo = GpsPoint::new(29.8683, 121.5440);
//! let jiujiang = GpsPoint::new(29.7047, 115.9920);
//!
//! let km = geo_utils::distance_km(&ningbo, &jiujiang);
//! assert!((km - 536.0).abs() < 10.0);
//! ```
//!
//! ## Algorithm Notes
//!
//! All functions work on a spherical Earth (mean radius ~6,371 km) using the
//! haversine family of formulas from the `geo` crate. Accuracy is within 0.3%
//! of the ellipsoidal distance, which is far below GPS noise at cycling scale.
//!
//! Inputs are assumed to be valid WGS84 coordinates; validation happens where
//! samples and routes enter the engine (see [`GpsPoint::try_new`]).

use geo::{Bearing, Destination, Distance, Haversine, Point};
use crate::GpsPoint;

// =============================================================================
// Distance / Bearing
// =============================================================================

#[inline]
fn to_point(p: &GpsPoint) -> Point<f64> {
    Point::new(p.longitude, p.latitude)
}

/// Great-circle distance between two points in kilometres.
///
/// Symmetric, zero for coincident points and monotonic with angular
/// separation.
///
/// # Example
///
/// ```rust
/// use ride_assist::{GpsPoint, geo_utils};
///
/// let a = GpsPoint::new(30.2741, 120.1551);
/// assert_eq!(geo_utils::distance_km(&a, &a), 0.0);
/// ```
#[inline]
pub fn distance_km(a: &GpsPoint, b: &GpsPoint) -> f64 {
    distance_m(a, b) / 1000.0
}

/// Great-circle distance between two points in meters.
#[inline]
pub fn distance_m(a: &GpsPoint, b: &GpsPoint) -> f64 {
    Haversine::distance(to_point(a), to_point(b))
}

/// Initial bearing from `a` to `b`, normalized to `[0, 360)` degrees
/// (north = 0, east = 90).
pub fn bearing_degrees(a: &GpsPoint, b: &GpsPoint) -> f64 {
    let bearing = Haversine::bearing(to_point(a), to_point(b));
    let normalized = bearing.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if normalized >= 360.0 {
        0.0
    } else {
        normalized
    }
}

/// Project a point `distance_km` along `bearing_degrees` from `origin`.
///
/// Inverse-consistent with [`distance_km`] and [`bearing_degrees`] within
/// floating point tolerance.
pub fn destination_point(origin: &GpsPoint, distance_km: f64, bearing_degrees: f64) -> GpsPoint {
    let projected = Haversine::destination(to_point(origin), bearing_degrees, distance_km * 1000.0);
    GpsPoint::new(projected.y(), projected.x())
}

/// Total length of an ordered list of points in kilometres.
///
/// Empty or single-point input returns 0.0.
pub fn polyline_length_km(points: &[GpsPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    points
        .windows(2)
        .map(|w| distance_km(&w[0], &w[1]))
        .sum()
}

/// Convert meters to approximate degrees at a given latitude.
///
/// Uses the longitude scale (the smaller of the two) so that a square
/// envelope built from the result always contains the true circle.
#[inline]
pub fn meters_to_degrees(meters: f64, latitude: f64) -> f64 {
    let lat_rad = latitude.to_radians();
    let meters_per_degree = 111_320.0 * lat_rad.cos().max(0.1);
    meters / meters_per_degree
}

// =============================================================================
// Unit Tests
// =============================================================================
