//! Great-circle and flat-earth helpers used by the flight physics.

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per degree of latitude in the flat-earth approximation.
pub const METERS_PER_DEG_LAT: f64 = 111_111.0;

/// Distance between two points in meters (Haversine formula).
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();

    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Initial bearing from point 1 to point 2, degrees in [0, 360).
pub fn initial_bearing(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dlambda = (lon2 - lon1).to_radians();

    let x = dlambda.sin() * phi2.cos();
    let y = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dlambda.cos();

    normalize_heading(x.atan2(y).to_degrees())
}

/// Wrap any angle into [0, 360).
pub fn normalize_heading(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Signed difference `target - current` folded into (-180, 180].
pub fn heading_difference(current: f64, target: f64) -> f64 {
    let diff = (target - current).rem_euclid(360.0);
    if diff > 180.0 {
        diff - 360.0
    } else {
        diff
    }
}

/// Turn from `current` toward `target`, never more than `max_turn` degrees.
pub fn limit_turn(current: f64, target: f64, max_turn: f64) -> f64 {
    let diff = heading_difference(current, target).clamp(-max_turn, max_turn);
    normalize_heading(current + diff)
}

/// Move `distance_m` along `bearing_deg` using the flat-earth approximation.
///
/// Longitude degrees are scaled by cos(latitude) of the starting point.
pub fn offset_flat(lat: f64, lon: f64, distance_m: f64, bearing_deg: f64) -> (f64, f64) {
    let (dlat, dlon) = flat_delta(lat, distance_m, bearing_deg);
    (lat + dlat, lon + dlon)
}

/// Latitude/longitude delta for a flat-earth displacement.
pub fn flat_delta(lat: f64, distance_m: f64, bearing_deg: f64) -> (f64, f64) {
    let bearing = bearing_deg.to_radians();
    let dlat = distance_m * bearing.cos() / METERS_PER_DEG_LAT;
    let dlon = distance_m * bearing.sin() / (METERS_PER_DEG_LAT * lat.to_radians().cos());
    (dlat, dlon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearing_to_northeast_point_is_in_first_quadrant() {
        let bearing = initial_bearing(45.9000, 6.8000, 45.9100, 6.8100);
        assert!((0.0..90.0).contains(&bearing), "got {bearing}");
        // Reference geodesic value is ~34.8 degrees
        assert!((bearing - 34.8).abs() < 0.5, "got {bearing}");
    }

    #[test]
    fn bearing_cardinal_directions() {
        assert!(initial_bearing(45.0, 6.0, 46.0, 6.0).abs() < 1e-9);
        assert!((initial_bearing(45.0, 6.0, 44.0, 6.0) - 180.0).abs() < 1e-9);
        let east = initial_bearing(0.0, 0.0, 0.0, 1.0);
        assert!((east - 90.0).abs() < 1e-9);
        let west = initial_bearing(0.0, 0.0, 0.0, -1.0);
        assert!((west - 270.0).abs() < 1e-9);
    }

    #[test]
    fn haversine_one_degree_latitude() {
        let d = haversine_distance(45.0, 6.0, 46.0, 6.0);
        assert!((d - 111_195.0).abs() < 100.0, "got {d}");
        assert_eq!(haversine_distance(45.0, 6.0, 45.0, 6.0), 0.0);
    }

    #[test]
    fn heading_difference_takes_short_way_round() {
        assert_eq!(heading_difference(350.0, 10.0), 20.0);
        assert_eq!(heading_difference(10.0, 350.0), -20.0);
        assert_eq!(heading_difference(0.0, 180.0), 180.0);
        assert_eq!(heading_difference(180.0, 0.0), 180.0);
    }

    #[test]
    fn limit_turn_clamps_and_wraps() {
        assert_eq!(limit_turn(350.0, 10.0, 15.0), 5.0);
        assert_eq!(limit_turn(10.0, 350.0, 15.0), 355.0);
        assert_eq!(limit_turn(100.0, 105.0, 15.0), 105.0);
        assert_eq!(limit_turn(0.0, 90.0, 15.0), 15.0);
    }

    #[test]
    fn flat_offset_matches_haversine_for_short_hops() {
        let (lat, lon) = offset_flat(45.9, 6.8, 500.0, 45.0);
        let d = haversine_distance(45.9, 6.8, lat, lon);
        assert!((d - 500.0).abs() < 2.0, "got {d}");
    }
}
