use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Normalized (0..1) box, centre + size.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn clamp01(self) -> Self {
        Self {
            cx: self.cx.clamp(0.0, 1.0),
            cy: self.cy.clamp(0.0, 1.0),
            w: self.w.clamp(0.0, 1.0),
            h: self.h.clamp(0.0, 1.0),
        }
    }
}

/// Latest summary from the vision pipeline. Only the newest one is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub has_violation: bool,
    pub class_label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    #[serde(with = "time::serde::timestamp")]
    pub captured_at: OffsetDateTime,
    /// Where the vision side stored the frame, if it did.
    #[serde(default)]
    pub frame_ref: Option<String>,
}

impl DetectionEvent {
    /// A frame with nothing of interest in it.
    pub fn clear(captured_at: OffsetDateTime) -> Self {
        Self {
            has_violation: false,
            class_label: String::new(),
            confidence: 0.0,
            bbox: BoundingBox::default(),
            captured_at,
            frame_ref: None,
        }
    }

    pub fn violation(class_label: impl Into<String>, confidence: f32, bbox: BoundingBox, captured_at: OffsetDateTime) -> Self {
        Self {
            has_violation: true,
            class_label: class_label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox: bbox.clamp01(),
            captured_at,
            frame_ref: None,
        }
    }

    pub fn with_frame_ref(mut self, frame_ref: impl Into<String>) -> Self {
        self.frame_ref = Some(frame_ref.into());
        self
    }

    /// Violation with confidence strictly above `min_confidence`.
    pub fn is_actionable(&self, min_confidence: f32) -> bool {
        self.has_violation && self.confidence > min_confidence
    }

    pub fn age(&self, now: OffsetDateTime) -> Duration {
        now - self.captured_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn confidence_threshold_is_strict() {
        let t0 = datetime!(2024-05-01 10:00:00 UTC);
        let ev = DetectionEvent::violation("ebike_on_strip", 0.6, BoundingBox::default(), t0);

        assert!(ev.is_actionable(0.5));
        assert!(!ev.is_actionable(0.6));
        assert!(!DetectionEvent::clear(t0).is_actionable(0.0));
    }

    #[test]
    fn violation_clamps_inputs() {
        let t0 = datetime!(2024-05-01 10:00:00 UTC);
        let bbox = BoundingBox { cx: 1.4, cy: -0.2, w: 0.5, h: 2.0 };
        let ev = DetectionEvent::violation("x", 1.7, bbox, t0);

        assert_eq!(ev.confidence, 1.0);
        assert_eq!(ev.bbox, BoundingBox { cx: 1.0, cy: 0.0, w: 0.5, h: 1.0 });
    }
}
