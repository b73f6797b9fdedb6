use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use patrol_proto::DetectionEvent;
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{CameraConfig, DetectionSource, FrameInterpreter, FrameReport, VisionConfig};

/// Live camera feed.
///
/// The detector process owns the camera and the model; it prints one
/// [`FrameReport`] per line on stdout. A reader task publishes each parsed frame
/// over a watch channel, so `poll` only ever sees the newest.
pub struct CameraFeed {
    child: Child,
    rx: watch::Receiver<Option<(FrameReport, OffsetDateTime)>>,
    interp: FrameInterpreter,
}

/// Resolves `program` the way a shell would.
pub fn find_program(program: &str) -> Option<PathBuf> {
    let p = Path::new(program);
    if p.components().count() > 1 {
        return p.is_file().then(|| p.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).map(|dir| dir.join(program)).find(|c| c.is_file())
}

impl CameraFeed {
    pub fn available(cfg: &CameraConfig) -> bool {
        cfg.command.first().and_then(|p| find_program(p)).is_some()
    }

    /// Starts the detector. Must be called from within the tokio runtime.
    pub fn spawn(cfg: &VisionConfig) -> Result<Self> {
        let (program, args) = cfg.camera.command.split_first().context("vision.camera.command is empty")?;
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).kill_on_drop(true);

        debug!("vision: spawning {:?}", cfg.camera.command);
        let mut child = cmd.spawn().with_context(|| format!("spawn detector {}", program))?;
        let stdout = child.stdout.take().context("detector stdout not captured")?;

        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match serde_json::from_str::<FrameReport>(&line) {
                        Ok(frame) => {
                            tx.send_replace(Some((frame, OffsetDateTime::now_utc())));
                        }
                        Err(e) => warn!("vision: bad detector line {:?}: {}", line, e),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!("vision: detector read failed: {}", e);
                        break;
                    }
                }
            }
        });

        info!("vision: camera detector started ({})", program);
        Ok(Self { child, rx, interp: FrameInterpreter::new(cfg) })
    }
}

impl DetectionSource for CameraFeed {
    fn name(&self) -> &'static str {
        "camera"
    }

    fn poll(&mut self) -> Result<Option<DetectionEvent>> {
        let latest = {
            let seen = self.rx.borrow_and_update();
            if seen.has_changed() {
                seen.clone()
            } else {
                None
            }
        };
        match latest {
            Some((frame, received_at)) => Ok(Some(self.interp.interpret(frame, received_at))),
            None if self.rx.has_changed().is_err() => {
                let status = self.child.try_wait().context("detector status")?;
                anyhow::bail!("camera detector exited ({:?})", status);
            }
            None => Ok(None),
        }
    }
}
