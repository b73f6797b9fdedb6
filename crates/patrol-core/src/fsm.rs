//! The patrol decision machine.
//!
//! Driven by a fixed-period timer, never by I/O. Each tick reads a snapshot of
//! the context, asks the navigator for advice and decides what (if anything) to
//! queue. It is the only holder of the [`CommandWriter`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use patrol_nav::{Advice, HeadingEstimator, NavParams, Navigator, Route, RouteStep, Suggestion, Waypoint};
use patrol_proto::{DetectionEvent, GeoPoint, MotionCommand};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::context::{CommandWriter, Enqueued, FaultReason, FsmState, NavigationContext, Snapshot};
use crate::liveness::Heartbeat;
use crate::shutdown::Shutdown;
use crate::triggers::{EvidenceRequest, SyncReason, SyncRequest, Trigger, TriggerSender};

#[derive(Debug, Clone)]
pub struct FsmConfig {
    pub tick: Duration,
    pub nav: NavParams,
    pub heading_min_move_m: f64,
    pub forward_steps: u16,
    /// Wall time one forward step takes on the controller.
    pub forward_step_s: f64,
    pub turn_rate_dps: f64,
    pub min_turn_settle_s: f64,
    pub stale_timeout_s: f64,
    /// Fix age at which the machine gives up and faults.
    pub gps_hard_limit_s: f64,
    /// While driving, re-enter `PATROL_TURN` once |delta| exceeds `turn_threshold_deg * realign_factor`.
    pub realign_factor: f64,
    pub violation_min_confidence: f32,
    pub detection_max_age_s: f64,
    pub capture_timeout_s: f64,
    pub sync_timeout_s: f64,
    pub log_every: Duration,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(200),
            nav: NavParams::default(),
            heading_min_move_m: 1.0,
            forward_steps: 2,
            forward_step_s: 1.0,
            turn_rate_dps: 90.0,
            min_turn_settle_s: 0.5,
            stale_timeout_s: 2.0,
            gps_hard_limit_s: 10.0,
            realign_factor: 2.0,
            violation_min_confidence: 0.5,
            detection_max_age_s: 2.0,
            capture_timeout_s: 10.0,
            sync_timeout_s: 30.0,
            log_every: Duration::from_secs(2),
        }
    }
}

fn secs(s: f64) -> time::Duration {
    time::Duration::seconds_f64(s.max(0.0))
}

/// Outcome of one steering tick in a turn phase.
enum Steer {
    Arrived,
    Aligned,
    Wait,
}

/// Outcome of one driving tick in a go phase.
enum Cruise {
    Arrived,
    Drifted,
    Continue,
}

#[derive(Debug, Clone, Copy)]
struct Awaiting {
    id: u64,
    deadline: OffsetDateTime,
}

/// Edge detector for passing back through the base radius.
#[derive(Debug, Default, Clone, Copy)]
struct BaseWatch {
    seen: bool,
    departed: bool,
}

pub struct DecisionMachine {
    ctx: Arc<NavigationContext>,
    writer: CommandWriter,
    triggers: TriggerSender,
    route: Route,
    navigator: Navigator,
    heading: HeadingEstimator,
    cfg: FsmConfig,

    state: FsmState,
    /// Until when the last turn or forward step is still being executed.
    busy_until: Option<OffsetDateTime>,
    homing_go: bool,
    resume_to: FsmState,
    pending: Option<DetectionEvent>,
    awaiting: Option<Awaiting>,
    last_violation_at: Option<OffsetDateTime>,
    last_fix_at: Option<OffsetDateTime>,
    base: BaseWatch,
    last_suggestion: Option<Suggestion>,
    last_log: Option<OffsetDateTime>,
}

impl DecisionMachine {
    pub fn new(
        ctx: Arc<NavigationContext>,
        writer: CommandWriter,
        triggers: TriggerSender,
        route: Route,
        cfg: FsmConfig,
    ) -> Result<Self> {
        anyhow::ensure!(!route.is_empty(), "route has no waypoints");
        patrol_nav::doctor::check_nav_params(&cfg.nav)?;
        anyhow::ensure!(cfg.forward_steps > 0, "forward_steps must be > 0");
        anyhow::ensure!(cfg.turn_rate_dps > 0.0, "turn_rate_dps must be > 0");
        anyhow::ensure!(
            ctx.waypoint_index() < route.len(),
            "waypoint index {} outside route of {}",
            ctx.waypoint_index(),
            route.len()
        );
        ctx.write_state(FsmState::Boot);
        Ok(Self {
            navigator: Navigator::new(cfg.nav),
            heading: HeadingEstimator::new(cfg.heading_min_move_m),
            ctx,
            writer,
            triggers,
            route,
            cfg,
            state: FsmState::Boot,
            busy_until: None,
            homing_go: false,
            resume_to: FsmState::PatrolTurn,
            pending: None,
            awaiting: None,
            last_violation_at: None,
            last_fix_at: None,
            base: BaseWatch::default(),
            last_suggestion: None,
            last_log: None,
        })
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    pub fn config(&self) -> &FsmConfig {
        &self.cfg
    }

    /// Leaves `FAULT` for `BOOT`. The waypoint index is kept.
    pub fn reset(&mut self, now: OffsetDateTime) -> bool {
        if self.state != FsmState::Fault {
            return false;
        }
        let next = self.reset_from_fault();
        self.set_state(next, now);
        true
    }

    pub fn tick(&mut self, now: OffsetDateTime) -> FsmState {
        let snap = self.ctx.read();
        let stale_timeout = secs(self.cfg.stale_timeout_s);
        let pos = snap.fix.filter(|f| f.is_fresh(now, stale_timeout)).map(|f| {
            if self.last_fix_at != Some(f.received_at) {
                self.last_fix_at = Some(f.received_at);
                self.heading.observe(f.point);
            }
            f.point
        });

        let next = self.step(&snap, pos, now);
        self.set_state(next, now);
        self.log_progress(now);
        next
    }

    fn step(&mut self, snap: &Snapshot, pos: Option<GeoPoint>, now: OffsetDateTime) -> FsmState {
        let reset = self.ctx.take_reset_request();
        if self.state == FsmState::Fault {
            return if reset { self.reset_from_fault() } else { FsmState::Fault };
        }
        if reset {
            debug!("fsm: reset request ignored in {}", self.state);
        }
        if let Some(reason) = snap.fault.clone() {
            return self.enter_fault(reason);
        }
        if let Some(reason) = self.gps_lost(snap, now) {
            return self.enter_fault(reason);
        }
        // Only a moving rover is preempted; BOOT, SYNC_UPLOAD and IDLE are already stationary.
        if matches!(self.state, FsmState::PatrolTurn | FsmState::PatrolGo | FsmState::ReturnHome) {
            if let Some(ev) = self.fresh_violation(snap, now) {
                return self.preempt(ev);
            }
        }
        if let Some(p) = pos {
            self.watch_base(p, now);
        }

        match self.state {
            FsmState::Boot => {
                if let Some(p) = pos {
                    info!("fsm: first fix at {:.6},{:.6}, starting patrol", p.lat, p.lon);
                    FsmState::PatrolTurn
                } else {
                    FsmState::Boot
                }
            }
            FsmState::PatrolTurn => self.patrol_turn(pos, now),
            FsmState::PatrolGo => self.patrol_go(pos, now),
            FsmState::Investigate => self.investigate(snap, now),
            FsmState::CaptureEvidence => self.await_ack(now, "capture", FsmState::CaptureEvidence),
            FsmState::ReturnHome => self.return_home(pos, now),
            FsmState::SyncUpload => self.await_ack(now, "sync", FsmState::SyncUpload),
            FsmState::Idle => FsmState::Idle,
            FsmState::Fault => FsmState::Fault,
        }
    }

    fn set_state(&mut self, next: FsmState, now: OffsetDateTime) {
        if next == self.state {
            return;
        }
        info!("fsm: {} -> {} (wp={})", self.state, next, self.ctx.waypoint_index());
        if next == FsmState::ReturnHome {
            self.homing_go = false;
        }
        self.state = next;
        self.ctx.write_state(next);
        self.last_log = Some(now);
    }

    // ----- patrol legs -----

    fn target(&self) -> Option<Waypoint> {
        self.route.get(self.ctx.waypoint_index()).copied()
    }

    fn patrol_turn(&mut self, pos: Option<GeoPoint>, now: OffsetDateTime) -> FsmState {
        let Some(target) = self.target() else {
            return self.enter_fault(FaultReason::External("waypoint index outside route".into()));
        };
        // Without a fresh fix, hold; the hard limit decides when to give up.
        let Some(p) = pos else { return FsmState::PatrolTurn };
        match self.steer(p, &target, now) {
            Steer::Arrived => self.arrive(),
            Steer::Aligned => FsmState::PatrolGo,
            Steer::Wait => FsmState::PatrolTurn,
        }
    }

    fn patrol_go(&mut self, pos: Option<GeoPoint>, now: OffsetDateTime) -> FsmState {
        let Some(target) = self.target() else {
            return self.enter_fault(FaultReason::External("waypoint index outside route".into()));
        };
        match self.cruise(pos, &target, now) {
            Cruise::Arrived => self.arrive(),
            Cruise::Drifted => FsmState::PatrolTurn,
            Cruise::Continue => FsmState::PatrolGo,
        }
    }

    fn return_home(&mut self, pos: Option<GeoPoint>, now: OffsetDateTime) -> FsmState {
        let Some(base) = self.route.base().copied() else {
            return self.enter_fault(FaultReason::External("route has no base".into()));
        };
        let arrived = if self.homing_go {
            match self.cruise(pos, &base, now) {
                Cruise::Arrived => true,
                Cruise::Drifted => {
                    self.homing_go = false;
                    false
                }
                Cruise::Continue => false,
            }
        } else {
            match pos.map(|p| self.steer(p, &base, now)) {
                Some(Steer::Arrived) => true,
                Some(Steer::Aligned) => {
                    self.homing_go = true;
                    false
                }
                Some(Steer::Wait) | None => false,
            }
        };
        if !arrived {
            return FsmState::ReturnHome;
        }

        info!("fsm: home reached, requesting sync");
        self.send(MotionCommand::Stop);
        self.busy_until = None;
        let id = self.triggers.next_id();
        let fired = self.triggers.fire(Trigger::Sync(SyncRequest {
            id,
            point: pos,
            requested_at: now,
            reason: SyncReason::RouteComplete,
        }));
        if fired {
            self.awaiting = Some(Awaiting { id, deadline: now + secs(self.cfg.sync_timeout_s) });
            FsmState::SyncUpload
        } else {
            FsmState::Idle
        }
    }

    /// Turn phase: probe for a heading, issue at most one turn, then wait for it to settle.
    fn steer(&mut self, p: GeoPoint, target: &Waypoint, now: OffsetDateTime) -> Steer {
        let s = self.navigator.suggest(p, target, self.heading.estimate());
        self.last_suggestion = Some(s);
        if s.arrived {
            return Steer::Arrived;
        }
        if self.is_busy(now) {
            return Steer::Wait;
        }
        match s.advice() {
            Advice::Arrived => Steer::Arrived,
            Advice::Forward => Steer::Aligned,
            Advice::ProbeHeading => {
                debug!("fsm: heading unknown, probing forward");
                self.forward(now);
                Steer::Wait
            }
            Advice::Turn { delta_deg } => {
                self.turn(delta_deg, now);
                Steer::Wait
            }
        }
    }

    /// Go phase: keep stepping forward while roughly on course.
    fn cruise(&mut self, pos: Option<GeoPoint>, target: &Waypoint, now: OffsetDateTime) -> Cruise {
        if let Some(p) = pos {
            let s = self.navigator.suggest(p, target, self.heading.estimate());
            self.last_suggestion = Some(s);
            if s.arrived {
                return Cruise::Arrived;
            }
            let limit = self.cfg.nav.turn_threshold_deg * self.cfg.realign_factor;
            match s.bearing_delta_deg {
                Some(d) if d.abs() <= limit => {}
                Some(d) => {
                    debug!("fsm: off course by {:.1} deg, realigning", d);
                    return Cruise::Drifted;
                }
                None => return Cruise::Drifted,
            }
        }
        // No fresh fix: keep the last bearing until the hard limit.
        if !self.is_busy(now) {
            self.forward(now);
        }
        Cruise::Continue
    }

    fn arrive(&mut self) -> FsmState {
        let idx = self.ctx.waypoint_index();
        info!("fsm: reached waypoint {}", idx);
        match self.route.step_from(idx) {
            RouteStep::Next(next) => {
                self.ctx.set_waypoint_index(next);
                FsmState::PatrolTurn
            }
            RouteStep::Wrapped => {
                self.ctx.set_waypoint_index(0);
                FsmState::PatrolTurn
            }
            RouteStep::Exhausted => {
                info!("fsm: route complete, returning to base");
                FsmState::ReturnHome
            }
        }
    }

    fn is_busy(&self, now: OffsetDateTime) -> bool {
        self.busy_until.map_or(false, |t| now < t)
    }

    fn turn(&mut self, delta_deg: f64, now: OffsetDateTime) {
        let Some(cmd) = MotionCommand::turn_by(delta_deg) else { return };
        let signed = f64::from(cmd.signed_degrees().unwrap_or(0));
        self.send(cmd);
        self.heading.note_turn(signed);
        let settle = (signed.abs() / self.cfg.turn_rate_dps).max(self.cfg.min_turn_settle_s);
        self.busy_until = Some(now + secs(settle));
    }

    fn forward(&mut self, now: OffsetDateTime) {
        let steps = self.cfg.forward_steps;
        self.send(MotionCommand::Forward { steps });
        self.busy_until = Some(now + secs(f64::from(steps) * self.cfg.forward_step_s));
    }

    fn send(&self, cmd: MotionCommand) {
        match self.writer.enqueue(cmd) {
            Enqueued::Accepted => debug!("fsm: queued {:?}", cmd),
            Enqueued::DroppedOldest(_) => {}
            Enqueued::Rejected => debug!("fsm: {:?} rejected, shutting down", cmd),
        }
    }

    // ----- violations and evidence -----

    fn fresh_violation(&self, snap: &Snapshot, now: OffsetDateTime) -> Option<DetectionEvent> {
        let ev = snap.detection.as_ref()?;
        if !ev.is_actionable(self.cfg.violation_min_confidence) {
            return None;
        }
        if ev.age(now) > secs(self.cfg.detection_max_age_s) {
            return None;
        }
        if self.last_violation_at.map_or(false, |t| ev.captured_at <= t) {
            return None;
        }
        Some(ev.clone())
    }

    fn preempt(&mut self, ev: DetectionEvent) -> FsmState {
        warn!(
            "fsm: violation `{}` conf={:.2} during {}, stopping",
            ev.class_label, ev.confidence, self.state
        );
        self.writer.preempt(MotionCommand::Stop);
        self.busy_until = None;
        self.last_violation_at = Some(ev.captured_at);
        self.resume_to = if self.state == FsmState::ReturnHome { FsmState::ReturnHome } else { FsmState::PatrolTurn };
        self.pending = Some(ev);
        FsmState::Investigate
    }

    fn investigate(&mut self, snap: &Snapshot, now: OffsetDateTime) -> FsmState {
        let Some(ev) = self.pending.take() else { return self.resume(now) };
        let id = self.triggers.next_id();
        let req = EvidenceRequest {
            id,
            point: snap.fix.map(|f| f.point),
            requested_at: now,
            waypoint_index: snap.waypoint_index,
            class_label: ev.class_label,
            confidence: ev.confidence,
            frame_ref: ev.frame_ref,
        };
        if !self.triggers.fire(Trigger::CaptureEvidence(req)) {
            return self.resume(now);
        }
        self.awaiting = Some(Awaiting { id, deadline: now + secs(self.cfg.capture_timeout_s) });
        FsmState::CaptureEvidence
    }

    fn await_ack(&mut self, now: OffsetDateTime, what: &str, waiting: FsmState) -> FsmState {
        let done = match self.awaiting {
            Some(w) if self.ctx.is_acked(w.id) => {
                info!("fsm: {} #{} acknowledged", what, w.id);
                true
            }
            Some(w) if now >= w.deadline => {
                warn!("fsm: {} #{} not acknowledged in time, moving on", what, w.id);
                true
            }
            Some(_) => false,
            None => true,
        };
        if !done {
            return waiting;
        }
        self.awaiting = None;
        match waiting {
            FsmState::SyncUpload => FsmState::Idle,
            _ => self.resume(now),
        }
    }

    fn resume(&mut self, now: OffsetDateTime) -> FsmState {
        self.awaiting = None;
        // Anything captured while stopped belongs to the violation just handled.
        self.last_violation_at = Some(self.last_violation_at.map_or(now, |t| t.max(now)));
        self.resume_to
    }

    fn watch_base(&mut self, p: GeoPoint, now: OffsetDateTime) {
        if !self.route.looping || !matches!(self.state, FsmState::PatrolTurn | FsmState::PatrolGo) {
            return;
        }
        let Some(base) = self.route.base() else { return };
        if self.navigator.within_radius(p, base) {
            if self.base.departed {
                info!("fsm: back at base, requesting sync");
                let id = self.triggers.next_id();
                self.triggers.fire(Trigger::Sync(SyncRequest {
                    id,
                    point: Some(p),
                    requested_at: now,
                    reason: SyncReason::BaseReturn,
                }));
            }
            self.base = BaseWatch { seen: true, departed: false };
        } else if self.base.seen {
            self.base.departed = true;
        }
    }

    // ----- faults -----

    fn gps_lost(&self, snap: &Snapshot, now: OffsetDateTime) -> Option<FaultReason> {
        if matches!(self.state, FsmState::Boot | FsmState::Idle) {
            return None;
        }
        let fix = snap.fix?;
        let age = fix.age(now);
        (age > secs(self.cfg.gps_hard_limit_s)).then(|| FaultReason::GpsLost { age_s: age.as_seconds_f64() })
    }

    fn enter_fault(&mut self, reason: FaultReason) -> FsmState {
        error!("fsm: FAULT in {}: {}", self.state, reason);
        self.writer.preempt(MotionCommand::Stop);
        self.ctx.raise_fault(reason);
        self.busy_until = None;
        self.pending = None;
        self.awaiting = None;
        FsmState::Fault
    }

    fn reset_from_fault(&mut self) -> FsmState {
        info!("fsm: reset from FAULT, waypoint {} kept", self.ctx.waypoint_index());
        self.ctx.clear_fault();
        self.heading.reset();
        self.busy_until = None;
        self.last_fix_at = None;
        self.base = BaseWatch::default();
        FsmState::Boot
    }

    fn log_progress(&mut self, now: OffsetDateTime) {
        let log_every = time::Duration::try_from(self.cfg.log_every).unwrap_or(time::Duration::MAX);
        if self.last_log.map_or(false, |t| now - t < log_every) {
            return;
        }
        self.last_log = Some(now);
        match self.last_suggestion {
            Some(s) => info!(
                "fsm: state={} wp={} dist={:.1}m bearing={:.0} delta={} heading={:?} queued={}",
                self.state,
                self.ctx.waypoint_index(),
                s.distance_m,
                s.target_bearing_deg,
                s.bearing_delta_deg.map_or_else(|| "?".to_string(), |d| format!("{:.0}", d)),
                self.heading.estimate(),
                self.ctx.queue_len()
            ),
            None => info!("fsm: state={} wp={}", self.state, self.ctx.waypoint_index()),
        }
    }
}

/// Shared so a restarted tick loop picks up exactly where the last one stopped.
pub type SharedMachine = Arc<tokio::sync::Mutex<DecisionMachine>>;

pub async fn run_machine(machine: SharedMachine, heartbeat: Heartbeat, mut shutdown: Shutdown) {
    let period = machine.lock().await.config().tick;
    let mut iv = tokio::time::interval(period);
    iv.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = iv.tick() => {
                machine.lock().await.tick(OffsetDateTime::now_utc());
                heartbeat.beat();
            }
        }
    }
    debug!("fsm: tick loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use patrol_nav::geo::destination;
    use patrol_proto::{BoundingBox, GpsFix, TurnDirection};
    use time::macros::datetime;
    use tokio::sync::mpsc;

    const T0: OffsetDateTime = datetime!(2024-05-01 10:00:00 UTC);
    const A: GeoPoint = GeoPoint::new(11.111111, 122.222222);
    const B: GeoPoint = GeoPoint::new(11.111211, 122.222322);

    fn ms(n: i64) -> time::Duration {
        time::Duration::milliseconds(n)
    }

    struct Rig {
        ctx: Arc<NavigationContext>,
        fsm: DecisionMachine,
        triggers: mpsc::Receiver<Trigger>,
    }

    impl Rig {
        fn new(looping: bool) -> Self {
            let ctx = NavigationContext::new(16);
            let writer = ctx.command_writer().unwrap();
            let (tx, rx) = TriggerSender::channel(8);
            let route = Route::new(vec![Waypoint::from(A), Waypoint::from(B)], looping);
            let fsm = DecisionMachine::new(ctx.clone(), writer, tx, route, FsmConfig::default()).unwrap();
            Self { ctx, fsm, triggers: rx }
        }

        fn fix(&self, p: GeoPoint, at: OffsetDateTime) {
            self.ctx.write_fix(GpsFix::new(p, at));
        }

        fn drain(&self) -> Vec<MotionCommand> {
            std::iter::from_fn(|| self.ctx.dequeue_command()).collect()
        }

        /// Puts the machine in PATROL_TURN toward A with a measured northbound course.
        fn heading_north_toward_a(&mut self) -> OffsetDateTime {
            let start = destination(A, 180.0, 20.0);
            self.fix(start, T0);
            assert_eq!(self.fsm.tick(T0), FsmState::PatrolTurn);
            let moved = destination(start, 0.0, 2.0);
            let t = T0 + ms(200);
            self.fix(moved, t);
            t
        }
    }

    #[test]
    fn boot_waits_for_a_fresh_fix() {
        let mut rig = Rig::new(true);
        assert_eq!(rig.fsm.tick(T0), FsmState::Boot);
        rig.fix(A, T0 - time::Duration::seconds(5));
        assert_eq!(rig.fsm.tick(T0), FsmState::Boot);
        rig.fix(destination(A, 180.0, 20.0), T0);
        assert_eq!(rig.fsm.tick(T0), FsmState::PatrolTurn);
        assert_eq!(rig.ctx.state(), FsmState::PatrolTurn);
    }

    #[test]
    fn unknown_heading_is_probed_with_one_forward() {
        let mut rig = Rig::new(true);
        rig.fix(destination(A, 90.0, 20.0), T0);
        rig.fsm.tick(T0);
        assert_eq!(rig.fsm.tick(T0 + ms(200)), FsmState::PatrolTurn);
        assert_eq!(rig.drain(), vec![MotionCommand::Forward { steps: 2 }]);

        // Still inside the probe step: nothing more.
        rig.fsm.tick(T0 + ms(400));
        assert!(rig.drain().is_empty());
    }

    #[test]
    fn aligned_course_goes_straight_to_go() {
        let mut rig = Rig::new(true);
        let t = rig.heading_north_toward_a();
        assert_eq!(rig.fsm.tick(t), FsmState::PatrolGo);
        assert!(rig.drain().is_empty());

        assert_eq!(rig.fsm.tick(t + ms(200)), FsmState::PatrolGo);
        assert_eq!(rig.drain(), vec![MotionCommand::Forward { steps: 2 }]);
        // Paced: the next step only after the first one has run.
        rig.fsm.tick(t + ms(400));
        assert!(rig.drain().is_empty());
        rig.fsm.tick(t + ms(2200));
        assert_eq!(rig.drain(), vec![MotionCommand::Forward { steps: 2 }]);
    }

    #[test]
    fn one_turn_then_settle_then_go() {
        let mut rig = Rig::new(true);
        // Course measured eastbound, A lies almost due north.
        let start = destination(A, 180.0, 20.0);
        rig.fix(start, T0);
        rig.fsm.tick(T0);
        let t = T0 + ms(200);
        rig.fix(destination(start, 90.0, 2.0), t);

        assert_eq!(rig.fsm.tick(t), FsmState::PatrolTurn);
        let cmds = rig.drain();
        assert_eq!(cmds.len(), 1);
        assert!(matches!(cmds[0], MotionCommand::Turn { direction: TurnDirection::Left, degrees } if degrees == 96));

        // Settling: no second turn.
        for k in 1..5 {
            assert_eq!(rig.fsm.tick(t + ms(200 * k)), FsmState::PatrolTurn);
        }
        assert!(rig.drain().is_empty());
        assert_eq!(rig.fsm.tick(t + ms(1800)), FsmState::PatrolGo);
        assert!(rig.drain().is_empty());
    }

    #[test]
    fn violation_preempts_and_keeps_waypoint() {
        let mut rig = Rig::new(true);
        let t = rig.heading_north_toward_a();
        rig.fsm.tick(t);
        rig.fsm.tick(t + ms(200));
        assert_eq!(rig.fsm.state(), FsmState::PatrolGo);
        assert_eq!(rig.ctx.queue_len(), 1);

        let seen = t + ms(300);
        rig.ctx.write_detection(DetectionEvent::violation("ebike", 0.9, BoundingBox::default(), seen).with_frame_ref("f-1"));
        assert_eq!(rig.fsm.tick(t + ms(400)), FsmState::Investigate);
        assert_eq!(rig.drain(), vec![MotionCommand::Stop]);
        assert_eq!(rig.ctx.waypoint_index(), 0);

        assert_eq!(rig.fsm.tick(t + ms(600)), FsmState::CaptureEvidence);
        let req = match rig.triggers.try_recv().unwrap() {
            Trigger::CaptureEvidence(r) => r,
            other => panic!("unexpected trigger {:?}", other),
        };
        assert_eq!(req.frame_ref.as_deref(), Some("f-1"));
        assert_eq!(req.waypoint_index, 0);
        assert!(req.point.is_some());

        assert_eq!(rig.fsm.tick(t + ms(800)), FsmState::CaptureEvidence);
        rig.ctx.ack_trigger(req.id);
        assert_eq!(rig.fsm.tick(t + ms(1000)), FsmState::PatrolTurn);
        assert_eq!(rig.ctx.waypoint_index(), 0);

        // Same event again is not a new violation.
        rig.fix(destination(A, 180.0, 18.0), t + ms(1000));
        assert_ne!(rig.fsm.tick(t + ms(1200)), FsmState::Investigate);
    }

    #[test]
    fn weak_or_old_detections_are_ignored() {
        let mut rig = Rig::new(true);
        let t = rig.heading_north_toward_a();
        rig.fsm.tick(t);

        rig.ctx.write_detection(DetectionEvent::violation("x", 0.4, BoundingBox::default(), t));
        assert_eq!(rig.fsm.tick(t + ms(200)), FsmState::PatrolGo);

        rig.ctx.write_detection(DetectionEvent::violation("x", 0.9, BoundingBox::default(), t + ms(300)));
        assert_eq!(rig.fsm.tick(t + ms(300) + time::Duration::seconds(3)), FsmState::PatrolGo);
    }

    #[test]
    fn capture_times_out() {
        let mut rig = Rig::new(true);
        let t = rig.heading_north_toward_a();
        rig.fsm.tick(t);
        rig.ctx.write_detection(DetectionEvent::violation("x", 0.9, BoundingBox::default(), t));
        rig.fsm.tick(t + ms(100));
        assert_eq!(rig.fsm.tick(t + ms(200)), FsmState::CaptureEvidence);

        // Keep GPS alive while waiting.
        let later = t + time::Duration::seconds(11);
        rig.fix(destination(A, 180.0, 18.0), later);
        assert_eq!(rig.fsm.tick(later), FsmState::PatrolTurn);
    }

    #[test]
    fn gps_loss_faults_with_stop_and_reset_recovers() {
        let mut rig = Rig::new(true);
        let t = rig.heading_north_toward_a();
        rig.fsm.tick(t);
        rig.fsm.tick(t + ms(200));
        assert_eq!(rig.fsm.state(), FsmState::PatrolGo);

        // Inside the grace window the rover keeps going.
        assert_eq!(rig.fsm.tick(t + time::Duration::seconds(5)), FsmState::PatrolGo);
        assert!(rig.drain().contains(&MotionCommand::Forward { steps: 2 }));

        assert_eq!(rig.fsm.tick(t + time::Duration::seconds(11)), FsmState::Fault);
        assert_eq!(rig.drain(), vec![MotionCommand::Stop]);
        assert!(matches!(rig.ctx.pending_fault(), Some(FaultReason::GpsLost { .. })));

        // Terminal: fresh data alone does not leave FAULT.
        let t2 = t + time::Duration::seconds(12);
        rig.fix(A, t2);
        assert_eq!(rig.fsm.tick(t2), FsmState::Fault);
        assert!(rig.drain().is_empty());

        rig.ctx.request_reset();
        assert_eq!(rig.fsm.tick(t2 + ms(200)), FsmState::Boot);
        assert_eq!(rig.ctx.pending_fault(), None);
        assert_eq!(rig.ctx.waypoint_index(), 0);
    }

    #[test]
    fn link_fault_from_context_halts() {
        let mut rig = Rig::new(true);
        let t = rig.heading_north_toward_a();
        rig.fsm.tick(t);
        rig.ctx.raise_fault(FaultReason::LinkDown { attempts: 5 });
        assert_eq!(rig.fsm.tick(t + ms(200)), FsmState::Fault);
        assert_eq!(rig.drain(), vec![MotionCommand::Stop]);
        assert!(rig.fsm.reset(t + ms(400)));
        assert_eq!(rig.fsm.state(), FsmState::Boot);
    }

    #[test]
    fn stationary_states_are_not_preempted() {
        let mut rig = Rig::new(true);
        rig.ctx.write_detection(DetectionEvent::violation("ebike", 0.9, BoundingBox::default(), T0));
        assert_eq!(rig.fsm.tick(T0 + ms(100)), FsmState::Boot);
        assert!(rig.drain().is_empty());
        assert!(rig.triggers.try_recv().is_err());
    }

    #[test]
    fn sub_degree_turn_threshold_is_refused() {
        let ctx = NavigationContext::new(4);
        let writer = ctx.command_writer().unwrap();
        let (tx, _rx) = TriggerSender::channel(1);
        let route = Route::new(vec![Waypoint::from(A), Waypoint::from(B)], true);
        let mut cfg = FsmConfig::default();
        cfg.nav.turn_threshold_deg = 0.4;
        assert!(DecisionMachine::new(ctx, writer, tx, route, cfg).is_err());
    }

    #[test]
    fn out_of_range_index_is_refused() {
        let ctx = NavigationContext::new(4);
        ctx.set_waypoint_index(5);
        let writer = ctx.command_writer().unwrap();
        let (tx, _rx) = TriggerSender::channel(1);
        let route = Route::new(vec![Waypoint::from(A), Waypoint::from(B)], false);
        assert!(DecisionMachine::new(ctx, writer, tx, route, FsmConfig::default()).is_err());
    }
}
