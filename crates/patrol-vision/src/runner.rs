use std::sync::Arc;
use std::time::{Duration, Instant};

use patrol_core::{Heartbeat, NavigationContext, Shutdown};
use tracing::{debug, error, info};

use crate::DetectionSource;

const LOG_EVERY: Duration = Duration::from_secs(10);

/// Polls `source` every `period` and publishes each new event to the context.
///
/// Returns when shutdown fires or the source fails; a failed source is left
/// for the supervisor to reopen.
pub async fn run_detection(
    mut source: Box<dyn DetectionSource>,
    ctx: Arc<NavigationContext>,
    period: Duration,
    heartbeat: Heartbeat,
    mut shutdown: Shutdown,
) {
    let mut iv = tokio::time::interval(period.max(Duration::from_millis(1)));
    iv.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let (mut events, mut violations) = (0u64, 0u64);
    let mut last_log = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = iv.tick() => {
                heartbeat.beat();
                match source.poll() {
                    Ok(Some(ev)) => {
                        events += 1;
                        if ev.has_violation {
                            violations += 1;
                            info!(
                                "vision: violation {} conf={:.2} frame={:?}",
                                ev.class_label, ev.confidence, ev.frame_ref
                            );
                        }
                        if !ctx.write_detection(ev) {
                            debug!("vision: dropped out-of-order event");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!("vision: {} source failed: {:#}", source.name(), e);
                        return;
                    }
                }
                if last_log.elapsed() >= LOG_EVERY {
                    last_log = Instant::now();
                    info!("vision: {} events={} violations={}", source.name(), events, violations);
                }
            }
        }
    }
    debug!("vision: {} stopped", source.name());
}
