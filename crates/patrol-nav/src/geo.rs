use patrol_proto::GeoPoint;

/// Mean Earth radius used for every distance in the crate.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance (haversine).
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Initial great-circle bearing from `from` to `to`, degrees clockwise from north in [0, 360).
pub fn initial_bearing_deg(from: GeoPoint, to: GeoPoint) -> f64 {
    let p1 = from.lat.to_radians();
    let p2 = to.lat.to_radians();
    let dlon = (to.lon - from.lon).to_radians();
    let y = dlon.sin() * p2.cos();
    let x = p1.cos() * p2.sin() - p1.sin() * p2.cos() * dlon.cos();
    wrap360(y.atan2(x).to_degrees())
}

/// Normalizes to [0, 360).
pub fn wrap360(deg: f64) -> f64 {
    let x = deg.rem_euclid(360.0);
    if x >= 360.0 { 0.0 } else { x }
}

/// Normalizes to (-180, 180].
pub fn wrap180(deg: f64) -> f64 {
    let x = wrap360(deg);
    if x > 180.0 { x - 360.0 } else { x }
}

/// Point reached travelling `distance_m` along `bearing_deg` from `from`.
pub fn destination(from: GeoPoint, bearing_deg: f64, distance_m: f64) -> GeoPoint {
    let d = distance_m / EARTH_RADIUS_M;
    let brg = bearing_deg.to_radians();
    let p1 = from.lat.to_radians();
    let l1 = from.lon.to_radians();
    let p2 = (p1.sin() * d.cos() + p1.cos() * d.sin() * brg.cos()).asin();
    let l2 = l1 + (brg.sin() * d.sin() * p1.cos()).atan2(d.cos() - p1.sin() * p2.sin());
    GeoPoint::new(p2.to_degrees(), wrap180(l2.to_degrees()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn one_degree_on_equator() {
        let o = GeoPoint::new(0.0, 0.0);
        assert!(close(haversine_m(o, GeoPoint::new(0.0, 1.0)), 111_194.926_644_558_7, 1e-6));
        assert!(close(haversine_m(o, GeoPoint::new(1.0, 0.0)), 111_194.926_644_558_7, 1e-6));
    }

    #[test]
    fn pinned_distances() {
        let a = GeoPoint::new(11.111111, 122.222222);
        let b = GeoPoint::new(11.111211, 122.222322);
        assert!(close(haversine_m(a, b), 15.578_649_926_788, 1e-6));

        let london = GeoPoint::new(51.5007, -0.1246);
        let liberty = GeoPoint::new(40.6892, -74.0445);
        assert!(close(haversine_m(london, liberty), 5_574_840.456_848, 1e-3));
    }

    #[test]
    fn distance_is_symmetric() {
        let pts = [
            GeoPoint::new(11.111111, 122.222222),
            GeoPoint::new(11.111211, 122.222322),
            GeoPoint::new(31.230416, 121.473701),
            GeoPoint::new(-33.8568, 151.2153),
            GeoPoint::new(64.1466, -21.9426),
        ];
        for a in pts {
            for b in pts {
                assert_eq!(haversine_m(a, b), haversine_m(b, a));
            }
        }
    }

    #[test]
    fn cardinal_bearings() {
        let o = GeoPoint::new(0.0, 0.0);
        assert!(close(initial_bearing_deg(o, GeoPoint::new(1.0, 0.0)), 0.0, 1e-9));
        assert!(close(initial_bearing_deg(o, GeoPoint::new(0.0, 1.0)), 90.0, 1e-9));
        assert!(close(initial_bearing_deg(o, GeoPoint::new(-1.0, 0.0)), 180.0, 1e-9));
        assert!(close(initial_bearing_deg(o, GeoPoint::new(0.0, -1.0)), 270.0, 1e-9));

        let a = GeoPoint::new(11.111111, 122.222222);
        let b = GeoPoint::new(11.111211, 122.222322);
        assert!(close(initial_bearing_deg(a, b), 44.457_925, 1e-5));
    }

    #[test]
    fn wrap180_range() {
        assert_eq!(wrap180(180.0), 180.0);
        assert_eq!(wrap180(-180.0), 180.0);
        assert_eq!(wrap180(190.0), -170.0);
        assert_eq!(wrap180(-190.0), 170.0);
        assert_eq!(wrap180(720.0), 0.0);
        assert_eq!(wrap360(-90.0), 270.0);
    }

    #[test]
    fn destination_round_trips_distance_and_bearing() {
        let a = GeoPoint::new(11.111111, 122.222222);
        let b = destination(a, 44.0, 12.5);
        assert!(close(haversine_m(a, b), 12.5, 1e-6));
        assert!(close(initial_bearing_deg(a, b), 44.0, 1e-6));
    }
}
