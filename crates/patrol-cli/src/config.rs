use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use patrol_core::{FsmConfig, SupervisorConfig, TrackerConfig, DEFAULT_QUEUE_CAPACITY};
use patrol_link::LinkConfig;
use patrol_nav::{NavParams, Route, Waypoint};
use patrol_vision::VisionConfig;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub uart: LinkConfig,
    #[serde(default)]
    pub gps: GpsCfg,
    pub patrol: PatrolCfg,
    #[serde(default)]
    pub fsm: FsmCfg,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub supervisor: SupervisorCfg,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GpsCfg {
    pub stale_timeout_s: f64,
    /// Defaults to a quarter of the stale timeout.
    pub check_interval_s: Option<f64>,
    pub hard_limit_s: f64,
    pub heading_min_move_m: f64,
    pub log_every_s: f64,
}

impl Default for GpsCfg {
    fn default() -> Self {
        Self { stale_timeout_s: 2.0, check_interval_s: None, hard_limit_s: 10.0, heading_min_move_m: 1.0, log_every_s: 2.0 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PatrolCfg {
    pub waypoints: Vec<Waypoint>,
    #[serde(rename = "loop")]
    pub looping: bool,
    pub arrive_radius_m: f64,
    pub turn_threshold_deg: f64,
    pub forward_steps: u16,
    pub forward_step_s: f64,
    pub turn_rate_dps: f64,
}

impl Default for PatrolCfg {
    fn default() -> Self {
        let nav = NavParams::default();
        Self {
            waypoints: Vec::new(),
            looping: true,
            arrive_radius_m: nav.arrive_radius_m,
            turn_threshold_deg: nav.turn_threshold_deg,
            forward_steps: 2,
            forward_step_s: 1.0,
            turn_rate_dps: 90.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FsmCfg {
    pub tick_ms: u64,
    pub violation_min_confidence: f32,
    pub detection_max_age_s: f64,
    pub capture_timeout_s: f64,
    pub sync_timeout_s: f64,
    pub queue_capacity: usize,
    pub realign_factor: f64,
    pub log_every_s: f64,
    /// Capture/sync triggers are appended here as JSON lines for the uploader.
    pub trigger_outbox: Option<PathBuf>,
}

impl Default for FsmCfg {
    fn default() -> Self {
        let d = FsmConfig::default();
        Self {
            tick_ms: d.tick.as_millis() as u64,
            violation_min_confidence: d.violation_min_confidence,
            detection_max_age_s: d.detection_max_age_s,
            capture_timeout_s: d.capture_timeout_s,
            sync_timeout_s: d.sync_timeout_s,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            realign_factor: d.realign_factor,
            log_every_s: d.log_every.as_secs_f64(),
            trigger_outbox: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SupervisorCfg {
    pub heartbeat_timeout_s: f64,
    pub check_interval_ms: u64,
    pub max_restarts: u32,
    /// How long units get to stop on shutdown.
    pub grace_s: f64,
    /// Snapshot of FSM and link state, rewritten while running; read by `patrol link status`.
    pub status_file: Option<PathBuf>,
    pub status_every_s: f64,
}

impl Default for SupervisorCfg {
    fn default() -> Self {
        let d = SupervisorConfig::default();
        Self {
            heartbeat_timeout_s: d.stale_after.as_secs_f64(),
            check_interval_ms: d.check_interval.as_millis() as u64,
            max_restarts: d.max_restarts,
            grace_s: 2.0,
            status_file: Some(PathBuf::from("/tmp/patrol-status.json")),
            status_every_s: 2.0,
        }
    }
}

fn secs(s: f64) -> Duration {
    Duration::try_from_secs_f64(s.max(0.0)).unwrap_or(Duration::MAX)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&s).context("parse config toml")
}

impl Config {
    pub fn route(&self) -> Route {
        Route::new(self.patrol.waypoints.clone(), self.patrol.looping)
    }

    pub fn nav_params(&self) -> NavParams {
        NavParams { arrive_radius_m: self.patrol.arrive_radius_m, turn_threshold_deg: self.patrol.turn_threshold_deg }
    }

    pub fn fsm_config(&self) -> FsmConfig {
        FsmConfig {
            tick: Duration::from_millis(self.fsm.tick_ms.max(1)),
            nav: self.nav_params(),
            heading_min_move_m: self.gps.heading_min_move_m,
            forward_steps: self.patrol.forward_steps,
            forward_step_s: self.patrol.forward_step_s,
            turn_rate_dps: self.patrol.turn_rate_dps,
            stale_timeout_s: self.gps.stale_timeout_s,
            gps_hard_limit_s: self.gps.hard_limit_s,
            realign_factor: self.fsm.realign_factor,
            violation_min_confidence: self.fsm.violation_min_confidence,
            detection_max_age_s: self.fsm.detection_max_age_s,
            capture_timeout_s: self.fsm.capture_timeout_s,
            sync_timeout_s: self.fsm.sync_timeout_s,
            log_every: secs(self.fsm.log_every_s),
            ..FsmConfig::default()
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        let mut t = TrackerConfig::new(secs(self.gps.stale_timeout_s));
        if let Some(every) = self.gps.check_interval_s {
            t.check_interval = secs(every).max(Duration::from_millis(10));
        }
        t.log_every = secs(self.gps.log_every_s);
        t
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            check_interval: Duration::from_millis(self.supervisor.check_interval_ms.max(10)),
            stale_after: secs(self.supervisor.heartbeat_timeout_s),
            max_restarts: self.supervisor.max_restarts,
        }
    }

    pub fn grace(&self) -> Duration {
        secs(self.supervisor.grace_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patrol_vision::Backend;

    const SAMPLE: &str = r#"
[uart]
port = "/dev/ttyUSB0"
baud = 115200

[patrol]
loop = false
arrive_radius_m = 2.5
waypoints = [
  { lat = 11.111111, lon = 122.222222 },
  { lat = 11.111211, lon = 122.222322 },
]

[fsm]
tick_ms = 100

[vision]
backend = "synthetic"

[vision.synthetic]
violation_rate = 0.1
"#;

    #[test]
    fn sample_fills_in_defaults() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.uart.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cfg.uart.reconnect_attempts, 5);

        let route = cfg.route();
        assert_eq!(route.len(), 2);
        assert!(!route.looping);

        let fsm = cfg.fsm_config();
        assert_eq!(fsm.tick, Duration::from_millis(100));
        assert_eq!(fsm.nav.arrive_radius_m, 2.5);
        assert_eq!(fsm.nav.turn_threshold_deg, 8.0);
        assert_eq!(fsm.gps_hard_limit_s, 10.0);

        assert_eq!(cfg.vision.backend, Backend::Synthetic);
        assert_eq!(cfg.vision.synthetic.violation_rate, 0.1);
        assert_eq!(cfg.vision.poll_ms, 100);
        assert_eq!(cfg.supervisor_config().max_restarts, 3);
    }

    #[test]
    fn tracker_interval_follows_stale_timeout() {
        let mut cfg: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.tracker_config().check_interval, Duration::from_millis(500));

        cfg.gps.check_interval_s = Some(0.2);
        assert_eq!(cfg.tracker_config().check_interval, Duration::from_millis(200));
    }

    #[test]
    fn shipped_config_passes_route_checks() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/patrol.toml");
        let cfg = load_config(&path).unwrap();
        patrol_nav::doctor::check_route(&cfg.route(), &cfg.nav_params()).unwrap();
        assert_eq!(cfg.fsm.trigger_outbox, Some(PathBuf::from("/tmp/patrol-triggers.jsonl")));
    }

    #[test]
    fn patrol_section_is_required() {
        assert!(toml::from_str::<Config>("[uart]\nport = \"/dev/ttyS0\"\n").is_err());
    }
}
