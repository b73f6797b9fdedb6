//! Heading estimation without a compass.
//!
//! The course over ground is measured from GPS displacement once the rover has
//! moved at least `min_move_m` from the last anchor. Between two such
//! measurements, commanded turns are added onto the last measured course. With
//! neither available the estimate is [`HeadingEstimate::Unknown`] and callers
//! must move the rover before steering.

use patrol_proto::GeoPoint;

use crate::geo::{haversine_m, initial_bearing_deg, wrap360};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeadingEstimate {
    /// Measured from GPS displacement.
    Course(f64),
    /// Last measured course plus the turns commanded since.
    DeadReckoned(f64),
    Unknown,
}

impl HeadingEstimate {
    pub fn degrees(&self) -> Option<f64> {
        match *self {
            HeadingEstimate::Course(d) | HeadingEstimate::DeadReckoned(d) => Some(d),
            HeadingEstimate::Unknown => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeadingEstimator {
    min_move_m: f64,
    anchor: Option<GeoPoint>,
    last: Option<GeoPoint>,
    course: Option<f64>,
    turn_accum_deg: f64,
}

impl HeadingEstimator {
    pub fn new(min_move_m: f64) -> Self {
        Self {
            min_move_m: if min_move_m > 0.0 { min_move_m } else { 1.0 },
            anchor: None,
            last: None,
            course: None,
            turn_accum_deg: 0.0,
        }
    }

    /// Feeds a position. Returns true when a new course was measured.
    pub fn observe(&mut self, p: GeoPoint) -> bool {
        self.last = Some(p);
        let Some(anchor) = self.anchor else {
            self.anchor = Some(p);
            return false;
        };
        if haversine_m(anchor, p) < self.min_move_m {
            return false;
        }
        self.course = Some(initial_bearing_deg(anchor, p));
        self.turn_accum_deg = 0.0;
        self.anchor = Some(p);
        true
    }

    /// Records a commanded in-place turn (right positive). Displacement after the
    /// turn is measured from where the turn happened.
    pub fn note_turn(&mut self, signed_deg: f64) {
        if self.course.is_some() {
            self.turn_accum_deg += signed_deg;
        }
        if let Some(p) = self.last {
            self.anchor = Some(p);
        }
    }

    pub fn estimate(&self) -> HeadingEstimate {
        match self.course {
            None => HeadingEstimate::Unknown,
            Some(c) if self.turn_accum_deg == 0.0 => HeadingEstimate::Course(c),
            Some(c) => HeadingEstimate::DeadReckoned(wrap360(c + self.turn_accum_deg)),
        }
    }

    /// Forget everything, e.g. after a fault reset.
    pub fn reset(&mut self) {
        *self = Self::new(self.min_move_m);
    }
}
