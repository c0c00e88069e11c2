//! Geodesic helpers. Every distance in this crate goes through
//! [`haversine_m`]; nothing else is allowed to compute one.

/// Mean Earth radius, meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two (lat, lon) points in degrees, meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();

    let a = (dphi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Ground speed implied by moving `distance_m` in `elapsed_s`, km/h.
pub fn speed_kmh(distance_m: f64, elapsed_s: f64) -> f64 {
    if elapsed_s <= 0.0 {
        return f64::INFINITY;
    }
    distance_m / elapsed_s * 3.6
}

/// North/south and east/west residuals between two points, meters.
/// Small-displacement approximation, which is what the consistency gate
/// needs; full distances go through [`haversine_m`].
pub fn residuals_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> (f64, f64) {
    let dlat_m = (lat2 - lat1).to_radians() * EARTH_RADIUS_M;
    let mean_lat = ((lat1 + lat2) / 2.0).to_radians();
    let dlon_m = (lon2 - lon1).to_radians() * EARTH_RADIUS_M * mean_lat.cos();
    (dlat_m, dlon_m)
}

/// Weighted centroid of (lat, lon, weight) triples computed on the unit
/// sphere. Averaging in 3-D Cartesian space avoids the classic arithmetic
/// mean failure across the antimeridian and near the poles.
pub fn weighted_centroid(points: &[(f64, f64, f64)]) -> Option<(f64, f64)> {
    let total_weight: f64 = points.iter().map(|(_, _, w)| w).sum();
    if points.is_empty() || total_weight <= 0.0 {
        return None;
    }

    let (mut x, mut y, mut z) = (0.0, 0.0, 0.0);
    for &(lat, lon, w) in points {
        let (phi, lambda) = (lat.to_radians(), lon.to_radians());
        x += phi.cos() * lambda.cos() * w;
        y += phi.cos() * lambda.sin() * w;
        z += phi.sin() * w;
    }
    x /= total_weight;
    y /= total_weight;
    z /= total_weight;

    let norm = (x * x + y * y + z * z).sqrt();
    if norm == 0.0 {
        // All mass cancelled out (antipodal inputs); no meaningful centroid.
        return None;
    }

    let lat = z.atan2((x * x + y * y).sqrt()).to_degrees();
    let lon = y.atan2(x).to_degrees();
    Some((lat, lon))
}

/// Weighted standard deviation of `values` under `weights`.
pub fn weighted_std_dev(values: &[f64], weights: &[f64]) -> f64 {
    let total: f64 = weights.iter().sum();
    if values.is_empty() || total <= 0.0 {
        return 0.0;
    }
    let mean: f64 = values
        .iter()
        .zip(weights)
        .map(|(v, w)| v * w)
        .sum::<f64>()
        / total;
    let variance: f64 = values
        .iter()
        .zip(weights)
        .map(|(v, w)| w * (v - mean).powi(2))
        .sum::<f64>()
        / total;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn haversine_of_identical_points_is_zero() {
        assert_eq!(haversine_m(59.33, 18.06, 59.33, 18.06), 0.0);
        assert_eq!(haversine_m(0.0, 0.0, 0.0, 0.0), 0.0);
        assert_eq!(haversine_m(-90.0, 120.0, -90.0, 120.0), 0.0);
    }

    #[test]
    fn haversine_matches_known_distances() {
        // Stockholm city center to Arlanda airport, roughly 37 km.
        let d = haversine_m(59.3293, 18.0686, 59.6519, 17.9186);
        assert!((35_000.0..39_000.0).contains(&d), "got {d}");

        // One degree of latitude is about 111.2 km everywhere.
        let d = haversine_m(10.0, 25.0, 11.0, 25.0);
        assert!((110_500.0..112_000.0).contains(&d), "got {d}");
    }

    #[test]
    fn centroid_of_identical_points_is_that_point() {
        let points = vec![(59.33, 18.06, 1.0), (59.33, 18.06, 2.5), (59.33, 18.06, 0.1)];
        let (lat, lon) = weighted_centroid(&points).unwrap();
        assert!(haversine_m(lat, lon, 59.33, 18.06) < 1.0);
    }

    #[test]
    fn centroid_crosses_antimeridian_correctly() {
        let points = vec![(0.0, 179.9, 1.0), (0.0, -179.9, 1.0)];
        let (lat, lon) = weighted_centroid(&points).unwrap();
        assert!(lat.abs() < 0.01, "latitude drifted: {lat}");
        assert!(
            (lon.abs() - 180.0).abs() < 0.01,
            "centroid must sit near the antimeridian, got {lon}"
        );
    }

    #[test]
    fn centroid_weights_pull_toward_heavier_point() {
        let points = vec![(59.0, 18.0, 10.0), (60.0, 18.0, 1.0)];
        let (lat, _) = weighted_centroid(&points).unwrap();
        assert!(lat < 59.2, "heavy point should dominate, got {lat}");
    }

    #[test]
    fn centroid_of_empty_or_weightless_input_is_none() {
        assert!(weighted_centroid(&[]).is_none());
        assert!(weighted_centroid(&[(1.0, 2.0, 0.0)]).is_none());
    }

    #[test]
    fn std_dev_of_constant_values_is_zero() {
        assert_eq!(weighted_std_dev(&[5.0, 5.0, 5.0], &[1.0, 2.0, 3.0]), 0.0);
    }

    #[test]
    fn speed_is_infinite_for_zero_elapsed() {
        assert!(speed_kmh(100.0, 0.0).is_infinite());
        // 100 m in 10 s is 36 km/h.
        assert!((speed_kmh(100.0, 10.0) - 36.0).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn haversine_is_symmetric(
            lat1 in -90.0f64..90.0,
            lon1 in -180.0f64..180.0,
            lat2 in -90.0f64..90.0,
            lon2 in -180.0f64..180.0,
        ) {
            let ab = haversine_m(lat1, lon1, lat2, lon2);
            let ba = haversine_m(lat2, lon2, lat1, lon1);
            prop_assert!((ab - ba).abs() < 1e-6);
        }

        #[test]
        fn haversine_is_nonnegative_and_bounded(
            lat1 in -90.0f64..90.0,
            lon1 in -180.0f64..180.0,
            lat2 in -90.0f64..90.0,
            lon2 in -180.0f64..180.0,
        ) {
            let d = haversine_m(lat1, lon1, lat2, lon2);
            prop_assert!(d >= 0.0);
            // Half the Earth's circumference.
            prop_assert!(d <= std::f64::consts::PI * EARTH_RADIUS_M + 1.0);
        }

        #[test]
        fn centroid_of_single_point_is_identity(
            lat in -89.0f64..89.0,
            lon in -179.0f64..179.0,
        ) {
            let (clat, clon) = weighted_centroid(&[(lat, lon, 1.0)]).unwrap();
            prop_assert!(haversine_m(clat, clon, lat, lon) < 1.0);
        }
    }
}
