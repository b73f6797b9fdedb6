//! GPS freshness tracking.
//!
//! Fixes arrive from the transport pump through [`GpsTracker::on_fix`]. A
//! periodic check replaces a fix that has gone quiet with an invalidated copy so
//! every reader of the context sees the staleness, not only the decision machine.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use patrol_proto::GpsFix;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::context::NavigationContext;
use crate::liveness::Heartbeat;
use crate::shutdown::Shutdown;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub stale_timeout: Duration,
    pub check_interval: Duration,
    /// Minimum spacing between "GPS ok" log lines.
    pub log_every: Duration,
}

impl TrackerConfig {
    pub fn new(stale_timeout: Duration) -> Self {
        let check_interval = (stale_timeout / 4).clamp(Duration::from_millis(50), Duration::from_secs(1));
        Self { stale_timeout, check_interval, log_every: Duration::from_secs(2) }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[derive(Clone)]
pub struct GpsTracker {
    ctx: Arc<NavigationContext>,
    cfg: TrackerConfig,
    last_log: Arc<Mutex<Option<Instant>>>,
}

impl GpsTracker {
    pub fn new(ctx: Arc<NavigationContext>, cfg: TrackerConfig) -> Self {
        Self { ctx, cfg, last_log: Arc::new(Mutex::new(None)) }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.cfg
    }

    fn stale_timeout(&self) -> time::Duration {
        time::Duration::try_from(self.cfg.stale_timeout).unwrap_or(time::Duration::MAX)
    }

    /// Records a decoded fix. Returns false if a newer fix was already held.
    pub fn on_fix(&self, fix: GpsFix) -> bool {
        if !self.ctx.write_fix(fix) {
            debug!("gps: out-of-order fix from {} ignored", fix.received_at);
            return false;
        }
        let mut last = self.last_log.lock().unwrap_or_else(PoisonError::into_inner);
        if last.map_or(true, |t| t.elapsed() >= self.cfg.log_every) {
            info!("gps: fix lat={:.6} lon={:.6}", fix.point.lat, fix.point.lon);
            *last = Some(Instant::now());
        }
        true
    }

    /// Invalidates the held fix if it has gone stale. Returns true when it did.
    pub fn check(&self, now: OffsetDateTime) -> bool {
        match self.ctx.invalidate_stale_fix(now, self.stale_timeout()) {
            Some(stale) => {
                warn!(
                    "gps: no fix for {:.1}s (timeout {:?}), marked stale",
                    stale.age(now).as_seconds_f64(),
                    self.cfg.stale_timeout
                );
                true
            }
            None => false,
        }
    }

    pub async fn run(self, heartbeat: Heartbeat, mut shutdown: Shutdown) {
        let mut iv = tokio::time::interval(self.cfg.check_interval);
        iv.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = iv.tick() => {
                    heartbeat.beat();
                    self.check(OffsetDateTime::now_utc());
                }
            }
        }
        debug!("gps: tracker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patrol_proto::GeoPoint;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-05-01 10:00:00 UTC);

    fn tracker() -> (Arc<NavigationContext>, GpsTracker) {
        let ctx = NavigationContext::new(4);
        let t = GpsTracker::new(ctx.clone(), TrackerConfig::new(Duration::from_secs(2)));
        (ctx, t)
    }

    #[test]
    fn check_interval_follows_timeout() {
        assert_eq!(TrackerConfig::new(Duration::from_secs(2)).check_interval, Duration::from_millis(500));
        assert_eq!(TrackerConfig::new(Duration::from_millis(100)).check_interval, Duration::from_millis(50));
        assert_eq!(TrackerConfig::new(Duration::from_secs(60)).check_interval, Duration::from_secs(1));
    }

    #[test]
    fn fresh_then_stale_then_fresh_again() {
        let (ctx, t) = tracker();
        assert!(t.on_fix(GpsFix::new(GeoPoint::new(1.0, 2.0), T0)));

        assert!(!t.check(T0 + time::Duration::milliseconds(1900)));
        assert!(ctx.latest_fix().unwrap().valid);

        assert!(t.check(T0 + time::Duration::milliseconds(2100)));
        assert!(!ctx.latest_fix().unwrap().valid);

        assert!(t.on_fix(GpsFix::new(GeoPoint::new(1.0, 2.0), T0 + time::Duration::seconds(3))));
        assert!(ctx.latest_fix().unwrap().valid);
    }

    #[test]
    fn late_fix_does_not_overwrite() {
        let (ctx, t) = tracker();
        t.on_fix(GpsFix::new(GeoPoint::new(5.0, 5.0), T0 + time::Duration::seconds(5)));
        assert!(!t.on_fix(GpsFix::new(GeoPoint::new(4.0, 4.0), T0 + time::Duration::seconds(4))));
        assert_eq!(ctx.latest_fix().unwrap().point, GeoPoint::new(5.0, 5.0));
    }

    #[tokio::test]
    async fn run_loop_marks_stale_and_stops() {
        let ctx = NavigationContext::new(4);
        let t = GpsTracker::new(ctx.clone(), TrackerConfig::new(Duration::from_millis(100)));
        t.on_fix(GpsFix::new(GeoPoint::new(1.0, 1.0), OffsetDateTime::now_utc()));

        let (trigger, shutdown) = crate::shutdown::shutdown_channel();
        let hb = Heartbeat::new("gps");
        let task = tokio::spawn(t.run(hb.clone(), shutdown));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!ctx.latest_fix().unwrap().valid);
        assert!(hb.age() < Duration::from_millis(200));

        trigger.fire();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
