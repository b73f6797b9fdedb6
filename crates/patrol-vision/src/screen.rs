use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use patrol_proto::DetectionEvent;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::{DetectionSource, FrameInterpreter, FrameReport, VisionConfig};

/// Screen-capture stand-in: follows a JSON-lines file that a desktop detector
/// appends [`FrameReport`]s to. A file that shrinks is read again from the start.
pub struct ScreenFeed {
    path: PathBuf,
    file: Option<File>,
    pos: u64,
    partial: Vec<u8>,
    interp: FrameInterpreter,
}

impl ScreenFeed {
    pub fn available(path: &Path) -> bool {
        path.is_file()
    }

    pub fn new(cfg: &VisionConfig) -> Self {
        Self {
            path: cfg.screen.path.clone(),
            file: None,
            pos: 0,
            partial: Vec::new(),
            interp: FrameInterpreter::new(cfg),
        }
    }

    fn read_new(&mut self) -> Result<Vec<u8>> {
        if self.file.is_none() {
            if !self.path.exists() {
                return Ok(Vec::new());
            }
            let f = File::open(&self.path).with_context(|| format!("open {}", self.path.display()))?;
            info!("vision: following {}", self.path.display());
            self.file = Some(f);
            self.pos = 0;
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(Vec::new());
        };

        let len = file.metadata()?.len();
        if len < self.pos {
            warn!("vision: {} was truncated, rereading", self.path.display());
            self.pos = 0;
            self.partial.clear();
        }
        file.seek(SeekFrom::Start(self.pos))?;
        let mut chunk = Vec::new();
        let n = file.read_to_end(&mut chunk)?;
        self.pos += n as u64;
        Ok(chunk)
    }
}

impl DetectionSource for ScreenFeed {
    fn name(&self) -> &'static str {
        "screen"
    }

    fn poll(&mut self) -> Result<Option<DetectionEvent>> {
        let chunk = self.read_new()?;
        if chunk.is_empty() {
            return Ok(None);
        }
        self.partial.extend_from_slice(&chunk);

        // Bytes after the last newline may end mid-character; they wait for the rest.
        let mut latest = None;
        while let Some(nl) = self.partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=nl).collect();
            let line = match std::str::from_utf8(&raw) {
                Ok(line) => line.trim(),
                Err(e) => {
                    warn!("vision: skipping non-UTF-8 screen feed line: {}", e);
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<FrameReport>(line) {
                Ok(frame) => latest = Some(frame),
                Err(e) => warn!("vision: bad screen feed line {:?}: {}", line, e),
            }
        }
        Ok(latest.map(|frame| self.interp.interpret(frame, OffsetDateTime::now_utc())))
    }
}
