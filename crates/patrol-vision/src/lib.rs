//! Detection sources. Inference runs outside this process; the backends here turn
//! whatever it reports into [`DetectionEvent`]s for the navigation context.

mod nms;
pub mod camera;
pub mod rule;
pub mod runner;
pub mod screen;
pub mod select;
pub mod synthetic;

use std::path::PathBuf;

use anyhow::Result;
use patrol_proto::{BoundingBox, DetectionEvent};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use rule::{FrameInterpreter, ViolationRule};
pub use runner::run_detection;
pub use select::{open_source, probe_backend};

/// One raw detection as reported by the inference side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: i32,
    #[serde(default)]
    pub class_name: Option<String>,
    pub conf: f32,
    // normalized 0..1
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

impl Detection {
    pub fn bbox(&self) -> BoundingBox {
        BoundingBox { cx: self.cx, cy: self.cy, w: self.w, h: self.h }
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn label(&self) -> String {
        self.class_name.clone().unwrap_or_else(|| format!("class{}", self.class_id))
    }
}

/// One line of a detector feed: everything seen in a single frame.
///
/// `{"ts":1718000000.25,"frame_ref":"frames/000123.jpg","detections":[{"class_id":0,"conf":0.8,"cx":0.5,"cy":0.6,"w":0.3,"h":0.4}]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameReport {
    /// Capture time in unix seconds. Missing means "when it was read".
    #[serde(default)]
    pub ts: Option<f64>,
    #[serde(default)]
    pub frame_ref: Option<String>,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl FrameReport {
    pub fn captured_at(&self, received_at: OffsetDateTime) -> OffsetDateTime {
        self.ts
            .filter(|t| t.is_finite())
            .and_then(|t| OffsetDateTime::from_unix_timestamp_nanos((t * 1e9) as i128).ok())
            .unwrap_or(received_at)
    }
}

/// Something that can be asked for the latest detection without blocking.
pub trait DetectionSource: Send {
    fn name(&self) -> &'static str;

    /// The newest event since the previous call, or `None` if nothing new arrived.
    fn poll(&mut self) -> Result<Option<DetectionEvent>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Auto,
    Camera,
    Screen,
    Synthetic,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Backend::Auto => "auto",
            Backend::Camera => "camera",
            Backend::Screen => "screen",
            Backend::Synthetic => "synthetic",
        };
        f.write_str(s)
    }
}

/// `[vision]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub backend: Backend,
    pub poll_ms: u64,

    pub conf_threshold: f32,
    pub nms_iou_threshold: f32,
    pub max_detections: usize,

    pub camera: CameraConfig,
    pub screen: ScreenConfig,
    pub synthetic: SyntheticConfig,
    pub violation: ViolationRule,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Auto,
            poll_ms: 100,
            conf_threshold: 0.25,
            nms_iou_threshold: 0.45,
            max_detections: 50,
            camera: CameraConfig::default(),
            screen: ScreenConfig::default(),
            synthetic: SyntheticConfig::default(),
            violation: ViolationRule::default(),
        }
    }
}

/// Live camera: an external detector process writing one [`FrameReport`] per line on stdout.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub command: Vec<String>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self { command: vec!["patrol-detector".into(), "--source".into(), "picam".into()] }
    }
}

/// Screen-capture stand-in: a JSON-lines file appended to by a desktop detector.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
    pub path: PathBuf,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("/tmp/patrol-screen.jsonl") }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Probability that a poll yields a violation.
    pub violation_rate: f64,
    pub label: String,
    pub seed: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self { violation_rate: 0.02, label: "ebike_with_strip_nearby".into(), seed: None }
    }
}

pub fn nms_filter(mut dets: Vec<Detection>, iou_th: f32, max_det: usize) -> Vec<Detection> {
    dets.sort_by(|a, b| b.conf.partial_cmp(&a.conf).unwrap_or(std::cmp::Ordering::Equal));
    let mut kept: Vec<Detection> = Vec::new();

    'outer: for d in dets {
        for k in &kept {
            if k.class_id == d.class_id && nms::iou(&d.bbox(), &k.bbox()) >= iou_th {
                continue 'outer;
            }
        }
        kept.push(d);
        if kept.len() >= max_det {
            break;
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_id: i32, conf: f32, cx: f32) -> Detection {
        Detection { class_id, class_name: None, conf, cx, cy: 0.5, w: 0.2, h: 0.2 }
    }

    #[test]
    fn nms_keeps_best_of_overlapping_same_class() {
        let kept = nms_filter(vec![det(0, 0.6, 0.50), det(0, 0.9, 0.51), det(2, 0.5, 0.50)], 0.45, 10);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].conf, 0.9);
        assert_eq!(kept[1].class_id, 2);
    }

    #[test]
    fn frame_timestamp_falls_back_to_receipt() {
        let received = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let mut frame: FrameReport = serde_json::from_str(r#"{"detections":[]}"#).unwrap();
        assert_eq!(frame.captured_at(received), received);

        frame.ts = Some(1_700_000_001.5);
        let at = frame.captured_at(received);
        assert_eq!(at.unix_timestamp(), 1_700_000_001);
        assert_eq!(at.millisecond(), 500);
    }

    #[test]
    fn backend_names_parse_lowercase() {
        #[derive(Deserialize)]
        struct Wrap {
            backend: Backend,
        }
        let w: Wrap = toml::from_str("backend = \"screen\"").unwrap();
        assert_eq!(w.backend, Backend::Screen);
        assert_eq!(Backend::Synthetic.to_string(), "synthetic");
    }
}
