//! Transport pump: the only task that touches the serial channel.
//!
//! Motion commands are taken from the context queue in order and written one
//! whole frame at a time, interleaved only with the pump's own status queries.
//! Inbound bytes are reassembled into lines, decoded, and routed: GPS fixes to
//! the tracker, everything else to the link status.

use std::sync::Arc;
use std::time::{Duration, Instant};

use patrol_core::{FaultReason, GpsTracker, Heartbeat, NavigationContext, Shutdown};
use patrol_proto::{decode_line, encode, ConfigCommand, LineDecoder, Outbound, ParseError, Telemetry};
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::channel::Connector;
use crate::{state, LinkError};

const BEAT_EVERY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub write_timeout: Duration,
    pub reconnect_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub status_every: Option<Duration>,
    pub query_config_on_connect: bool,
    pub max_line: usize,
    pub log_every: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        crate::LinkConfig::default().pump_config()
    }
}

/// How a session ended without an I/O error.
enum SessionEnd {
    Shutdown,
}

pub struct TransportPump<C: Connector> {
    connector: C,
    ctx: Arc<NavigationContext>,
    tracker: GpsTracker,
    cfg: PumpConfig,
}

impl<C: Connector> TransportPump<C> {
    pub fn new(connector: C, ctx: Arc<NavigationContext>, tracker: GpsTracker, cfg: PumpConfig) -> Self {
        Self { connector, ctx, tracker, cfg }
    }

    /// Runs until shutdown, or until reconnecting has failed `reconnect_attempts`
    /// times in a row, in which case a link fault is raised.
    pub async fn run(mut self, heartbeat: Heartbeat, mut shutdown: Shutdown) {
        let mut backoff = Backoff::new(self.cfg.backoff_base, self.cfg.backoff_max, self.cfg.reconnect_attempts);
        let target = self.connector.describe();

        loop {
            heartbeat.beat();
            if shutdown.is_triggered() {
                break;
            }
            match self.connector.connect().await {
                Ok(io) => {
                    info!("link: connected {}", target);
                    self.ctx.update_link(|l| l.connected = true);
                    let mut healthy = false;
                    let res = self.session(io, &heartbeat, &mut shutdown, &mut healthy).await;
                    self.ctx.update_link(|l| l.connected = false);
                    if healthy {
                        backoff.reset();
                    }
                    match res {
                        Ok(SessionEnd::Shutdown) => break,
                        Err(e) => warn!("link: {} lost: {}", target, e),
                    }
                }
                Err(e) => warn!("link: connect {} failed: {}", target, e),
            }

            let Some(delay) = backoff.next_delay() else {
                let attempts = backoff.attempts();
                error!("link: giving up on {} after {} attempts", target, attempts);
                self.ctx.raise_fault(FaultReason::LinkDown { attempts });
                break;
            };
            self.ctx.update_link(|l| l.reconnects += 1);
            debug!("link: retry {} in {:?}", backoff.attempts(), delay);
            if !sleep_beating(delay, &heartbeat, &mut shutdown).await {
                break;
            }
        }
        debug!("link: pump stopped");
    }

    async fn session(
        &mut self,
        io: C::Io,
        heartbeat: &Heartbeat,
        shutdown: &mut Shutdown,
        healthy: &mut bool,
    ) -> Result<SessionEnd, LinkError> {
        let (mut rd, mut wr) = tokio::io::split(io);
        let mut decoder = LineDecoder::new(self.cfg.max_line);
        let mut buf = [0u8; 512];

        let mut beat = tokio::time::interval(BEAT_EVERY);
        beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut status = tokio::time::interval(self.cfg.status_every.unwrap_or(Duration::from_secs(3600)));
        status.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        status.reset();
        let mut last_log = Instant::now();

        if self.cfg.query_config_on_connect {
            self.write(&mut wr, ConfigCommand::QueryConfig.into()).await?;
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    // Flush what is left, normally the final Stop.
                    while let Some(cmd) = self.ctx.dequeue_command() {
                        self.write(&mut wr, cmd.into()).await?;
                    }
                    return Ok(SessionEnd::Shutdown);
                }
                cmd = self.ctx.next_command() => match cmd {
                    Some(cmd) => self.write(&mut wr, cmd.into()).await?,
                    None => return Ok(SessionEnd::Shutdown),
                },
                n = rd.read(&mut buf) => {
                    let n = n?;
                    if n == 0 {
                        return Err(LinkError::Closed);
                    }
                    decoder.feed(&buf[..n]);
                    while let Some(line) = decoder.next_line() {
                        if self.route(&line) {
                            *healthy = true;
                        }
                    }
                }
                _ = status.tick(), if self.cfg.status_every.is_some() => {
                    self.write(&mut wr, ConfigCommand::QueryStatus.into()).await?;
                }
                _ = beat.tick() => {
                    heartbeat.beat();
                    if last_log.elapsed() >= self.cfg.log_every {
                        last_log = Instant::now();
                        let link = self.ctx.link();
                        info!(
                            "link: rx_age={:?} acks={} errors={} parse_errors={} queued={}",
                            link.rx_age(), link.acks, link.errors, link.parse_errors, self.ctx.queue_len()
                        );
                    }
                }
            }
        }
    }

    async fn write<W: AsyncWrite + Unpin>(&self, wr: &mut W, out: Outbound) -> Result<(), LinkError> {
        let bytes = match encode(&out) {
            Ok(b) => b,
            Err(e) => {
                warn!("link: not sending {:?}: {}", out, e);
                return Ok(());
            }
        };
        let io = async {
            wr.write_all(&bytes).await?;
            wr.flush().await
        };
        match tokio::time::timeout(self.cfg.write_timeout, io).await {
            Ok(Ok(())) => {
                debug!("link: tx {}", String::from_utf8_lossy(&bytes).trim_end());
                Ok(())
            }
            Ok(Err(e)) => Err(LinkError::Io(e)),
            Err(_) => Err(LinkError::WriteTimeout(self.cfg.write_timeout)),
        }
    }

    /// Decodes and routes one line. Returns true for recognised telemetry.
    fn route(&self, line: &str) -> bool {
        let decoded = decode_line(line, OffsetDateTime::now_utc());
        if !matches!(decoded, Err(ParseError::Empty)) {
            self.ctx.update_link(|l| state::record_line(l, line));
        }
        match decoded {
            Ok(Telemetry::Gps(fix)) => {
                self.tracker.on_fix(fix);
                true
            }
            Ok(t) => {
                self.ctx.update_link(|l| state::apply(l, &t));
                true
            }
            Err(ParseError::Empty) => false,
            Err(ParseError::NoFix) => {
                debug!("link: controller reports no GPS fix");
                true
            }
            Err(ParseError::Unrecognized(other)) => {
                debug!("link: ignoring {:?}", other);
                false
            }
            Err(e) => {
                warn!("link: bad line {:?}: {}", line, e);
                self.ctx.update_link(|l| l.parse_errors += 1);
                false
            }
        }
    }
}

/// Sleeps for `d` while keeping the heartbeat alive. False if shutdown fired.
async fn sleep_beating(d: Duration, heartbeat: &Heartbeat, shutdown: &mut Shutdown) -> bool {
    let deadline = tokio::time::Instant::now() + d;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return true;
        }
        let step = (deadline - now).min(BEAT_EVERY);
        tokio::select! {
            _ = shutdown.wait() => return false,
            _ = tokio::time::sleep(step) => heartbeat.beat(),
        }
    }
}
