use patrol_proto::GeoPoint;

use crate::geo::{haversine_m, initial_bearing_deg, wrap180};
use crate::heading::HeadingEstimate;
use crate::route::Waypoint;

#[derive(Debug, Clone, Copy)]
pub struct NavParams {
    /// Distance strictly below which a waypoint counts as reached.
    pub arrive_radius_m: f64,
    /// Bearing error strictly below which the rover counts as aligned.
    pub turn_threshold_deg: f64,
}

impl Default for NavParams {
    fn default() -> Self {
        Self { arrive_radius_m: 3.0, turn_threshold_deg: 8.0 }
    }
}

/// What the navigator thinks should happen next. Advice only: the decision
/// machine decides what is actually sent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Advice {
    Arrived,
    /// Turn by `delta_deg` (right positive).
    Turn { delta_deg: f64 },
    Forward,
    /// Heading unknown: move forward so it can be measured.
    ProbeHeading,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Suggestion {
    pub distance_m: f64,
    pub target_bearing_deg: f64,
    /// Signed error in (-180, 180]; `None` while the heading is unknown.
    pub bearing_delta_deg: Option<f64>,
    pub arrived: bool,
    pub aligned: bool,
}

impl Suggestion {
    pub fn advice(&self) -> Advice {
        if self.arrived {
            return Advice::Arrived;
        }
        match self.bearing_delta_deg {
            None => Advice::ProbeHeading,
            Some(_) if self.aligned => Advice::Forward,
            Some(delta_deg) => Advice::Turn { delta_deg },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Navigator {
    params: NavParams,
}

impl Navigator {
    pub fn new(params: NavParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &NavParams {
        &self.params
    }

    pub fn suggest(&self, current: GeoPoint, target: &Waypoint, heading: HeadingEstimate) -> Suggestion {
        let distance_m = haversine_m(current, target.point);
        let target_bearing_deg = initial_bearing_deg(current, target.point);
        let bearing_delta_deg = heading.degrees().map(|h| wrap180(target_bearing_deg - h));
        let aligned = bearing_delta_deg
            .map(|d| d.abs() < self.params.turn_threshold_deg)
            .unwrap_or(false);

        Suggestion {
            distance_m,
            target_bearing_deg,
            bearing_delta_deg,
            arrived: distance_m < self.params.arrive_radius_m,
            aligned,
        }
    }

    /// Whether `p` lies inside the arrival radius of `wp`.
    pub fn within_radius(&self, p: GeoPoint, wp: &Waypoint) -> bool {
        haversine_m(p, wp.point) < self.params.arrive_radius_m
    }
}
