//! Geographic helpers shared by the queue and webhook filter: haversine
//! distance and the canonical coordinate-key formatting.
//!
//! Grounded on `LazyIVQueue/utils/geo_utils.py`.

/// Proximity-match threshold for `PriorityQueue::remove_by_match`.
pub const COORDINATE_MATCH_THRESHOLD_M: f64 = 70.0;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two points, in meters.
pub fn distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_phi = (lat2 - lat1).to_radians();
    let delta_lambda = (lon2 - lon1).to_radians();

    let a = (delta_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// True when two points are within `threshold_m` of each other.
pub fn within_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64, threshold_m: f64) -> bool {
    distance_m(lat1, lon1, lat2, lon2) <= threshold_m
}

/// Formats a coordinate to 6 decimal places, fixed-point, independent of
/// locale — used as part of a queue entry's fallback key when no spawnpoint
/// id is available.
pub fn format_coord6(v: f64) -> String {
    format!("{:.6}", v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_symmetric() {
        let d1 = distance_m(41.0, 29.0, 41.001, 29.001);
        let d2 = distance_m(41.001, 29.001, 41.0, 29.0);
        assert!((d1 - d2).abs() < 0.001);
    }

    #[test]
    fn distance_to_self_is_zero() {
        assert_eq!(distance_m(41.0, 29.0, 41.0, 29.0), 0.0);
    }

    #[test]
    fn within_threshold_detects_proximity() {
        // ~0.0005 degrees of latitude is roughly 55m.
        assert!(within_distance(1.0, 2.0, 1.0005, 2.0, COORDINATE_MATCH_THRESHOLD_M));
        assert!(!within_distance(1.0, 2.0, 1.01, 2.0, COORDINATE_MATCH_THRESHOLD_M));
    }

    #[test]
    fn coord_key_formatting_is_locale_independent() {
        assert_eq!(format_coord6(1.0), "1.000000");
        assert_eq!(format_coord6(-120.123456789), "-120.123457");
    }
}
