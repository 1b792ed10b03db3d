//! Geographic utilities: great-circle distance, bearing and dead-reckoning
//! projection on a spherical Earth, plus the speed-scaled arrival threshold
//! shared by the cruise scheduler and the route sequencer.
//!
//! All distances are in kilometres.

use crate::Position;

/// Mean Earth radius used by every formula in this module.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Fixed 5 m arrival radius. Superseded by [`arrival_threshold_km`], kept for
/// callers that still want a speed-independent radius.
pub const ARRIVAL_THRESHOLD_KM: f64 = 0.005;

/// Threshold used when the speed is not positive (1 mm).
pub const MIN_ARRIVAL_THRESHOLD_KM: f64 = 0.000_001;

/// km/h to km covered in 5 ms: 3600 s/h * 1000 ms/s / 5 ms.
const FIVE_MS_DIVISOR: f64 = 720_000.0;

/// Great-circle distance between two points using the Haversine formula.
///
/// # Example
/// ```
/// use route_cruise::Position;
/// use route_cruise::geo_utils::haversine_distance;
///
/// let a = Position::new(25.0, 121.5);
/// assert_eq!(haversine_distance(&a, &a), 0.0);
/// ```
pub fn haversine_distance(a: &Position, b: &Position) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_KM * c
}

/// Initial bearing from `a` to `b` in degrees, normalised to [0, 360).
///
/// Returns 0 when the points coincide.
pub fn bearing_to(a: &Position, b: &Position) -> f64 {
    if a == b {
        return 0.0;
    }

    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let y = d_lon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * d_lon.cos();

    let bearing = y.atan2(x).to_degrees();
    let normalized = (bearing + 360.0) % 360.0;
    // -0.0 and rounding at exactly 360 both fold back to 0
    if normalized >= 360.0 {
        0.0
    } else {
        normalized.abs()
    }
}

/// Position reached after moving from `p` along `bearing_deg` at a constant
/// `speed_kmh` for `duration_sec` seconds.
pub fn project(p: &Position, bearing_deg: f64, speed_kmh: f64, duration_sec: f64) -> Position {
    if duration_sec == 0.0 {
        return *p;
    }
    let distance_km = speed_kmh * duration_sec / 3600.0;
    project_distance(p, bearing_deg, distance_km)
}

/// Position reached after moving `distance_km` from `p` along `bearing_deg`.
pub fn project_distance(p: &Position, bearing_deg: f64, distance_km: f64) -> Position {
    if distance_km == 0.0 {
        return *p;
    }

    let lat = p.latitude.to_radians();
    let lon = p.longitude.to_radians();
    let bearing = bearing_deg.to_radians();
    let angular = distance_km / EARTH_RADIUS_KM;

    let new_lat = (lat.sin() * angular.cos() + lat.cos() * angular.sin() * bearing.cos()).asin();
    let new_lon = lon
        + (bearing.sin() * angular.sin() * lat.cos()).atan2(angular.cos() - lat.sin() * new_lat.sin());

    Position::new(new_lat.to_degrees(), new_lon.to_degrees())
}

/// Total length of a polyline.
pub fn polyline_length(points: &[Position]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

/// Distance below which a moving point counts as arrived.
///
/// This is the distance covered in exactly 5 ms at `speed_kmh`, so the time
/// spent inside the arrival radius is the same at every speed. Zero, negative
/// and non-finite speeds get the 1 mm floor instead.
pub fn arrival_threshold_km(speed_kmh: f64) -> f64 {
    if speed_kmh > 0.0 && speed_kmh.is_finite() {
        speed_kmh / FIVE_MS_DIVISOR
    } else {
        MIN_ARRIVAL_THRESHOLD_KM
    }
}
