use patrol_proto::GeoPoint;
use serde::{Deserialize, Serialize};

/// One route point; in config files written as `{ lat = .., lon = .. }`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    #[serde(flatten)]
    pub point: GeoPoint,
}

impl Waypoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { point: GeoPoint::new(lat, lon) }
    }
}

impl From<GeoPoint> for Waypoint {
    fn from(point: GeoPoint) -> Self {
        Self { point }
    }
}

/// Result of advancing the waypoint cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStep {
    Next(usize),
    /// Looping route went past the last point and starts over.
    Wrapped,
    /// Non-looping route has no more points.
    Exhausted,
}

/// Ordered patrol route. The first waypoint doubles as the base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub waypoints: Vec<Waypoint>,
    #[serde(rename = "loop", default)]
    pub looping: bool,
}

impl Route {
    pub fn new(waypoints: Vec<Waypoint>, looping: bool) -> Self {
        Self { waypoints, looping }
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Waypoint> {
        self.waypoints.get(idx)
    }

    pub fn base(&self) -> Option<&Waypoint> {
        self.waypoints.first()
    }

    /// Where the cursor goes after arriving at `idx`.
    pub fn step_from(&self, idx: usize) -> RouteStep {
        let next = idx + 1;
        if next < self.waypoints.len() {
            RouteStep::Next(next)
        } else if self.looping && !self.waypoints.is_empty() {
            RouteStep::Wrapped
        } else {
            RouteStep::Exhausted
        }
    }
}
