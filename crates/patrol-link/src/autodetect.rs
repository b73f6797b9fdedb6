use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use patrol_core::LinkState;
use patrol_proto::{decode_line, encode, ConfigCommand, LineDecoder, ParseError};
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use crate::channel::{open_serial, Connector};
use crate::{state, LinkConfig, LinkError};

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub port: String,
    pub baud: u32,
    pub answered: bool,
    pub elapsed_ms: u64,
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct AutodetectResult {
    pub chosen: Option<(String, u32)>,
    pub probes: Vec<ProbeResult>,
}

pub fn default_candidate_ports() -> Vec<String> {
    vec![
        "/dev/serial0".into(),
        "/dev/ttyAMA0".into(),
        "/dev/ttyS0".into(),
        "/dev/ttyUSB0".into(),
        "/dev/ttyUSB1".into(),
        "/dev/ttyACM0".into(),
        "/dev/ttyACM1".into(),
    ]
}

pub fn default_candidate_bauds() -> Vec<u32> {
    vec![115_200, 57_600, 9_600]
}

async fn first_telemetry_line<S>(io: &mut S) -> Result<Option<String>, LinkError>
where
    S: AsyncRead + Unpin,
{
    let mut decoder = LineDecoder::default();
    let mut buf = [0u8; 256];
    loop {
        let n = io.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        decoder.feed(&buf[..n]);
        while let Some(line) = decoder.next_line() {
            match decode_line(&line, OffsetDateTime::now_utc()) {
                Ok(_) | Err(ParseError::NoFix) => return Ok(Some(line)),
                Err(_) => {}
            }
        }
    }
}

/// Asks for `STATUS` and waits up to `timeout` for any recognisable telemetry line.
pub async fn probe_stream<S>(io: &mut S, timeout: Duration) -> Result<Option<String>, LinkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    io.write_all(&encode(&ConfigCommand::QueryStatus.into())?).await?;
    io.flush().await?;
    match tokio::time::timeout(timeout, first_telemetry_line(io)).await {
        Ok(res) => res,
        Err(_) => Ok(None),
    }
}

pub async fn autodetect(ports: Vec<String>, bauds: Vec<u32>, timeout: Duration) -> AutodetectResult {
    let mut probes = Vec::new();

    for port in ports {
        for baud in &bauds {
            let start = Instant::now();
            let (answered, note) = match open_serial(&port, *baud) {
                Ok(mut io) => match probe_stream(&mut io, timeout).await {
                    Ok(Some(line)) => (true, format!("answered {:?}", line)),
                    Ok(None) => (false, "silent".to_string()),
                    Err(e) => (false, format!("probe failed: {}", e)),
                },
                Err(e) => {
                    warn!("link autodetect: probe failed port={} baud={} err={}", port, baud, e);
                    (false, format!("open failed: {}", e))
                }
            };
            probes.push(ProbeResult {
                port: port.clone(),
                baud: *baud,
                answered,
                elapsed_ms: start.elapsed().as_millis() as u64,
                note,
            });
            if answered {
                info!("link autodetect: OK {} @ {}", port, baud);
                return AutodetectResult { chosen: Some((port, *baud)), probes };
            }
        }
    }

    AutodetectResult { chosen: None, probes }
}

pub async fn run_autodetect(cfg: &LinkConfig) -> AutodetectResult {
    let ports = cfg.candidate_ports.clone().unwrap_or_else(default_candidate_ports);
    let bauds = cfg.candidate_bauds.clone().unwrap_or_else(default_candidate_bauds);
    autodetect(ports, bauds, Duration::from_millis(cfg.probe_timeout_ms)).await
}

/// Port and baud to use, from config or by probing.
pub async fn resolve_port(cfg: &LinkConfig) -> Result<(String, u32)> {
    if cfg.autodetect {
        let res = run_autodetect(cfg).await;
        if let Some(chosen) = res.chosen {
            return Ok(chosen);
        }
        anyhow::bail!("uart autodetect failed: no candidate answered");
    }
    let port = cfg.port.clone().context("uart.port missing (autodetect=false)")?;
    let baud = cfg.baud.context("uart.baud missing (autodetect=false)")?;
    Ok((port, baud))
}

/// Connects once, asks for status and config, and collects replies for `listen`.
pub async fn query_status<C: Connector>(connector: &mut C, listen: Duration) -> Result<LinkState, LinkError> {
    let mut io = connector.connect().await?;
    let mut link = LinkState { connected: true, ..LinkState::default() };

    for q in [ConfigCommand::QueryStatus, ConfigCommand::QueryConfig] {
        io.write_all(&encode(&q.into())?).await?;
    }
    io.flush().await?;

    let mut decoder = LineDecoder::default();
    let mut buf = [0u8; 256];
    let deadline = tokio::time::Instant::now() + listen;
    loop {
        let n = match tokio::time::timeout_at(deadline, io.read(&mut buf)).await {
            Ok(n) => n?,
            Err(_) => break,
        };
        if n == 0 {
            link.connected = false;
            break;
        }
        decoder.feed(&buf[..n]);
        while let Some(line) = decoder.next_line() {
            if let Ok(t) = decode_line(&line, OffsetDateTime::now_utc()) {
                state::record_line(&mut link, &line);
                state::apply(&mut link, &t);
            }
        }
    }
    Ok(link)
}
