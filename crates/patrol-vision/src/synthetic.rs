use anyhow::Result;
use patrol_proto::{BoundingBox, DetectionEvent};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use time::OffsetDateTime;

use crate::{DetectionSource, SyntheticConfig};

/// Made-up detections for bench runs without any camera.
pub struct SyntheticSource {
    rng: StdRng,
    cfg: SyntheticConfig,
    frame: u64,
}

impl SyntheticSource {
    pub fn new(cfg: &SyntheticConfig) -> Self {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng, cfg: cfg.clone(), frame: 0 }
    }

    fn next_event(&mut self, now: OffsetDateTime) -> DetectionEvent {
        self.frame += 1;
        let frame_ref = format!("synthetic/{:06}", self.frame);
        if !self.rng.gen_bool(self.cfg.violation_rate.clamp(0.0, 1.0)) {
            return DetectionEvent::clear(now).with_frame_ref(frame_ref);
        }
        let bbox = BoundingBox {
            cx: self.rng.gen_range(0.2..0.8),
            cy: self.rng.gen_range(0.3..0.8),
            w: self.rng.gen_range(0.3..0.6),
            h: self.rng.gen_range(0.3..0.6),
        };
        let confidence = self.rng.gen_range(0.55..0.98);
        DetectionEvent::violation(self.cfg.label.clone(), confidence, bbox, now).with_frame_ref(frame_ref)
    }
}

impl DetectionSource for SyntheticSource {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn poll(&mut self) -> Result<Option<DetectionEvent>> {
        Ok(Some(self.next_event(OffsetDateTime::now_utc())))
    }
}
