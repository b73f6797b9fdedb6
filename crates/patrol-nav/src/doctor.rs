use anyhow::Result;

use crate::geo::haversine_m;
use crate::navigator::NavParams;
use crate::route::Route;

pub fn check_gps_thresholds(stale_timeout_s: f64, hard_limit_s: f64, heading_min_move_m: f64) -> Result<()> {
    anyhow::ensure!(stale_timeout_s > 0.0 && stale_timeout_s <= 30.0, "gps.stale_timeout_s should be in (0, 30]");
    anyhow::ensure!(hard_limit_s >= stale_timeout_s, "gps.hard_limit_s must be >= gps.stale_timeout_s");
    anyhow::ensure!(heading_min_move_m > 0.0 && heading_min_move_m < 20.0, "gps.heading_min_move_m out of range");
    Ok(())
}

pub fn check_nav_params(params: &NavParams) -> Result<()> {
    anyhow::ensure!(params.arrive_radius_m >= 0.5, "patrol.arrive_radius_m too small (GPS noise alone exceeds it)");
    // Turns are sent in whole degrees; a finer threshold could ask for a zero-degree turn.
    anyhow::ensure!(
        params.turn_threshold_deg >= 1.0 && params.turn_threshold_deg < 90.0,
        "patrol.turn_threshold_deg should be in [1, 90)"
    );
    Ok(())
}

pub fn check_route(route: &Route, params: &NavParams) -> Result<()> {
    anyhow::ensure!(route.len() >= 2, "patrol.waypoints must have >= 2 points");
    for (i, wp) in route.waypoints.iter().enumerate() {
        anyhow::ensure!(wp.point.is_valid(), "patrol.waypoints[{}] coordinates invalid", i);
    }
    // Consecutive points closer than the arrival radius would be "reached" on the spot.
    for (i, seg) in route.waypoints.windows(2).enumerate() {
        let d = haversine_m(seg[0].point, seg[1].point);
        anyhow::ensure!(
            d >= params.arrive_radius_m,
            "patrol.waypoints[{}]..[{}] are {:.2}m apart, less than arrive_radius_m",
            i,
            i + 1,
            d
        );
    }
    Ok(())
}
