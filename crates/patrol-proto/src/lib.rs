//! Shared data model and the ASCII line protocol spoken with the motor controller.

pub mod codec;
pub mod command;
pub mod detection;
pub mod telemetry;

use serde::{Deserialize, Serialize};

pub use codec::{decode_line, LineDecoder, ParseError};
pub use command::{encode, ConfigCommand, EncodeError, MotionCommand, Outbound, TurnDirection};
pub use detection::{BoundingBox, DetectionEvent};
pub use telemetry::{GpsFix, MotorStatus, Telemetry};

/// Latitude/longitude in decimal degrees (WGS84).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite() && self.lon.is_finite() && self.lat.abs() <= 90.0 && self.lon.abs() <= 180.0
    }
}
