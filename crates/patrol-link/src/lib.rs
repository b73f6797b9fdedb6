pub mod autodetect;
pub mod backoff;
pub mod channel;
pub mod pump;
pub mod state;

use std::time::Duration;

use serde::Deserialize;

pub use backoff::Backoff;
pub use channel::{Connector, SerialConnector};
pub use pump::{PumpConfig, TransportPump};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("open {port} @ {baud}: {source}")]
    Open {
        port: String,
        baud: u32,
        #[source]
        source: tokio_serial::Error,
    },
    #[error("encode: {0}")]
    Encode(#[from] patrol_proto::EncodeError),
    #[error("serial I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error("peer closed the link")]
    Closed,
    #[error("link unavailable: {0}")]
    Unavailable(String),
}

/// `[uart]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// When true, probe candidate ports/bauds and use the first that talks.
    pub autodetect: bool,

    /// When autodetect=false: fixed port config.
    pub port: Option<String>,
    pub baud: Option<u32>,

    /// Autodetect candidates. Defaults cover the Pi UARTs and USB bridges.
    pub candidate_ports: Option<Vec<String>>,
    pub candidate_bauds: Option<Vec<u32>>,
    /// How long to listen on each candidate.
    pub probe_timeout_ms: u64,

    /// Upper bound for one frame write.
    pub timeout_ms: u64,

    pub reconnect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    /// Period of `STATUS` queries; 0 disables them.
    pub status_every_s: f64,
    /// Send `CONFIG` right after each (re)connect.
    pub query_config_on_connect: bool,

    pub max_line: usize,
    pub log_every_s: f64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            autodetect: false,
            port: None,
            baud: Some(115_200),
            candidate_ports: None,
            candidate_bauds: None,
            probe_timeout_ms: 1500,
            timeout_ms: 500,
            reconnect_attempts: 5,
            backoff_base_ms: 250,
            backoff_max_ms: 4000,
            status_every_s: 0.0,
            query_config_on_connect: true,
            max_line: patrol_proto::codec::DEFAULT_MAX_LINE,
            log_every_s: 10.0,
        }
    }
}

impl LinkConfig {
    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            write_timeout: Duration::from_millis(self.timeout_ms.max(1)),
            reconnect_attempts: self.reconnect_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
            status_every: (self.status_every_s > 0.0).then(|| Duration::from_secs_f64(self.status_every_s)),
            query_config_on_connect: self.query_config_on_connect,
            max_line: self.max_line,
            log_every: Duration::from_secs_f64(self.log_every_s.max(0.5)),
        }
    }
}
