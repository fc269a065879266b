//! # Geographic Utilities
//!
//! Great-circle distance on a spherical Earth.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_km`] | Great-circle distance in kilometers |
//! | [`haversine_distance`] | Great-circle distance between two points in meters |
//! | [`segment_length_km`] | Straight start-to-end distance of a track in kilometers |
//!
//! ## Algorithm Notes
//!
//! The proximity thresholds are defined against a sphere of radius 6371.0 km, so the
//! formula is written out here instead of going through `geo::Haversine` (which uses
//! the IUGG mean radius of 6371.0088 km).
//!
//! Reference: [Haversine formula (Wikipedia)](https://en.wikipedia.org/wiki/Haversine_formula)

use crate::GpsPoint;

/// Mean Earth radius in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two lat/lon coordinates (degrees), in kilometers.
///
/// # Example
///
/// ```rust
/// use taxi_proximity::geo_utils::haversine_km;
///
/// // Porto City Hall to Porto São Bento station
/// let km = haversine_km(41.15794, -8.62911, 41.14567, -8.61046);
/// assert!(km > 1.5 && km < 2.5);
/// ```
#[inline]
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Great-circle distance between two GPS points, in meters.
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    haversine_km(p1.latitude, p1.longitude, p2.latitude, p2.longitude) * 1000.0
}

/// Distance between the first and last point of a track, in kilometers.
///
/// Empty and single-point tracks return 0.0.
pub fn segment_length_km(points: &[GpsPoint]) -> f64 {
    match (points.first(), points.last()) {
        (Some(first), Some(last)) => {
            haversine_km(first.latitude, first.longitude, last.latitude, last.longitude)
        }
        _ => 0.0,
    }
}
