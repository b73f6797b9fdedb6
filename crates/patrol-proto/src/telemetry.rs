use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::GeoPoint;

/// A position report stamped by the decoder.
///
/// Fixes are replaced, never edited: invalidation produces a new value with
/// `valid = false` and the original timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub point: GeoPoint,
    #[serde(with = "time::serde::timestamp")]
    pub received_at: OffsetDateTime,
    pub valid: bool,
}

impl GpsFix {
    pub fn new(point: GeoPoint, received_at: OffsetDateTime) -> Self {
        Self { point, received_at, valid: true }
    }

    pub fn age(&self, now: OffsetDateTime) -> Duration {
        now - self.received_at
    }

    /// Valid and not older than `stale_timeout` at `now`.
    pub fn is_fresh(&self, now: OffsetDateTime, stale_timeout: Duration) -> bool {
        self.valid && self.age(now) <= stale_timeout
    }

    pub fn invalidated(self) -> Self {
        Self { valid: false, ..self }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorStatus {
    pub motor_id: u8,
    pub target_rpm: f32,
    pub actual_rpm: f32,
    pub encoder_count: i64,
}

/// One decoded inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    Gps(GpsFix),
    /// `OK`: the last command was accepted.
    Ack,
    /// `ERRnn`: the last command was rejected.
    Error { code: u8 },
    /// `BOOT,OK`: the controller (re)started.
    Boot,
    /// `STATUS,...` with the raw fields after the prefix.
    Status(Vec<String>),
    /// `CONFIG,k,v,...` as key/value pairs.
    Config(Vec<(String, String)>),
    /// `STATE,<active>,<timed>`
    State { active: bool, timed: bool },
    Motor(MotorStatus),
    Servo { angle_deg: f32, busy: bool },
}

impl Telemetry {
    pub fn kind(&self) -> &'static str {
        match self {
            Telemetry::Gps(_) => "gps",
            Telemetry::Ack => "ok",
            Telemetry::Error { .. } => "err",
            Telemetry::Boot => "boot",
            Telemetry::Status(_) => "status",
            Telemetry::Config(_) => "config",
            Telemetry::State { .. } => "state",
            Telemetry::Motor(_) => "motor",
            Telemetry::Servo { .. } => "servo",
        }
    }
}
