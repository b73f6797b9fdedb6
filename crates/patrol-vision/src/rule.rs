//! Turns a frame's raw detections into a single [`DetectionEvent`].
//!
//! The violation rule: an e-bike close enough to the camera (box area above a
//! floor) whose centre lies near a charging-strip detection. When several pairs
//! qualify the one with the best combined area, proximity and confidence wins.
//! Positive verdicts are rate-limited by `cooldown_s` of capture time.

use patrol_proto::DetectionEvent;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::{nms, nms_filter, Detection, FrameReport, VisionConfig};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ViolationRule {
    pub enable: bool,
    pub ebike_class_id: i32,
    pub strip_class_id: i32,
    pub ebike_min_area_norm: f32,
    pub center_dist_norm: f32,
    pub cooldown_s: f64,
}

impl Default for ViolationRule {
    fn default() -> Self {
        Self {
            enable: true,
            ebike_class_id: 0,
            strip_class_id: 2,
            ebike_min_area_norm: 0.08,
            center_dist_norm: 0.25,
            cooldown_s: 1.0,
        }
    }
}

impl ViolationRule {
    /// Best qualifying (ebike, strip) pair, if any.
    pub fn best_pair<'a>(&self, dets: &'a [Detection]) -> Option<(&'a Detection, &'a Detection)> {
        let strips: Vec<&Detection> = dets.iter().filter(|d| d.class_id == self.strip_class_id).collect();
        let mut best: Option<(f32, &Detection, &Detection)> = None;

        let near_ebikes = dets
            .iter()
            .filter(|d| d.class_id == self.ebike_class_id && d.area() >= self.ebike_min_area_norm);
        for e in near_ebikes {
            for s in &strips {
                let dist = nms::center_distance(&e.bbox(), &s.bbox());
                if dist > self.center_dist_norm {
                    continue;
                }
                let score = e.area() * 2.0 + (1.0 - dist) + (e.conf + s.conf) * 0.5;
                if best.map_or(true, |(b, _, _)| score > b) {
                    best = Some((score, e, s));
                }
            }
        }
        best.map(|(_, e, s)| (e, s))
    }
}

pub struct FrameInterpreter {
    rule: ViolationRule,
    conf_threshold: f32,
    nms_iou_threshold: f32,
    max_detections: usize,
    last_violation: Option<OffsetDateTime>,
}

impl FrameInterpreter {
    pub fn new(cfg: &VisionConfig) -> Self {
        Self {
            rule: cfg.violation.clone(),
            conf_threshold: cfg.conf_threshold,
            nms_iou_threshold: cfg.nms_iou_threshold,
            max_detections: cfg.max_detections.max(1),
            last_violation: None,
        }
    }

    pub fn interpret(&mut self, frame: FrameReport, received_at: OffsetDateTime) -> DetectionEvent {
        let captured_at = frame.captured_at(received_at);
        let dets: Vec<Detection> = frame.detections.into_iter().filter(|d| d.conf >= self.conf_threshold).collect();
        let dets = nms_filter(dets, self.nms_iou_threshold, self.max_detections);

        let mut ev = match self.violation(&dets, captured_at) {
            Some(ev) => ev,
            None => DetectionEvent::clear(captured_at),
        };
        ev.frame_ref = frame.frame_ref;
        ev
    }

    fn violation(&mut self, dets: &[Detection], captured_at: OffsetDateTime) -> Option<DetectionEvent> {
        if !self.rule.enable {
            return None;
        }
        if let Some(last) = self.last_violation {
            if captured_at - last < Duration::seconds_f64(self.rule.cooldown_s) {
                return None;
            }
        }
        let (ebike, strip) = self.rule.best_pair(dets)?;
        self.last_violation = Some(captured_at);
        debug!(
            "vision: violation {} conf={:.2} near {} conf={:.2}",
            ebike.label(),
            ebike.conf,
            strip.label(),
            strip.conf
        );
        Some(DetectionEvent::violation(ebike.label(), ebike.conf, ebike.bbox(), captured_at))
    }
}
