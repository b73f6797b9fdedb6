use anyhow::Result;
use tracing::{info, warn};

use crate::camera::CameraFeed;
use crate::screen::ScreenFeed;
use crate::synthetic::SyntheticSource;
use crate::{Backend, DetectionSource, VisionConfig};

/// What `auto` resolves to on this machine: camera if the detector program is
/// installed, then the screen feed if its file exists, else synthetic.
pub fn probe_backend(cfg: &VisionConfig) -> Backend {
    match cfg.backend {
        Backend::Auto => {
            if CameraFeed::available(&cfg.camera) {
                Backend::Camera
            } else if ScreenFeed::available(&cfg.screen.path) {
                Backend::Screen
            } else {
                Backend::Synthetic
            }
        }
        other => other,
    }
}

/// Opens the configured source. In `auto` mode a camera that fails to start
/// falls through to the next candidate; an explicit backend fails hard.
pub fn open_source(cfg: &VisionConfig) -> Result<Box<dyn DetectionSource>> {
    let backend = probe_backend(cfg);
    info!("vision: backend {} (configured {})", backend, cfg.backend);
    match backend {
        Backend::Camera => match CameraFeed::spawn(cfg) {
            Ok(feed) => Ok(Box::new(feed)),
            Err(e) if cfg.backend == Backend::Auto => {
                warn!("vision: camera unavailable ({:#}), falling back", e);
                let fallback = VisionConfig {
                    backend: if ScreenFeed::available(&cfg.screen.path) { Backend::Screen } else { Backend::Synthetic },
                    ..cfg.clone()
                };
                open_source(&fallback)
            }
            Err(e) => Err(e),
        },
        Backend::Screen => Ok(Box::new(ScreenFeed::new(cfg))),
        Backend::Synthetic | Backend::Auto => Ok(Box::new(SyntheticSource::new(&cfg.synthetic))),
    }
}
