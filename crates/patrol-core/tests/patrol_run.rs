//! Closed-loop runs of the decision machine against a simulated rover.

use patrol_core::{DecisionMachine, FsmConfig, FsmState, NavigationContext, SyncReason, Trigger, TriggerSender};
use patrol_nav::geo::{destination, wrap360};
use patrol_nav::{Route, Waypoint};
use patrol_proto::{BoundingBox, DetectionEvent, GeoPoint, GpsFix, MotionCommand};
use std::sync::Arc;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;

const T0: OffsetDateTime = datetime!(2024-05-01 10:00:00 UTC);
const A: GeoPoint = GeoPoint::new(11.111111, 122.222222);
const B: GeoPoint = GeoPoint::new(11.111211, 122.222322);

/// Executes commands instantly: one forward step is one metre.
struct Rover {
    pos: GeoPoint,
    heading_deg: f64,
}

impl Rover {
    fn apply(&mut self, cmd: MotionCommand) {
        match cmd {
            MotionCommand::Turn { .. } => {
                let signed = cmd.signed_degrees().unwrap_or(0);
                self.heading_deg = wrap360(self.heading_deg + f64::from(signed));
            }
            MotionCommand::Forward { steps } => {
                self.pos = destination(self.pos, self.heading_deg, f64::from(steps));
            }
            MotionCommand::Stop => {}
        }
    }
}

struct Visit {
    state: FsmState,
    commands: Vec<MotionCommand>,
}

struct Sim {
    ctx: Arc<NavigationContext>,
    fsm: DecisionMachine,
    triggers: mpsc::Receiver<Trigger>,
    rover: Rover,
    visits: Vec<Visit>,
    fired: Vec<Trigger>,
    tick: i64,
}

impl Sim {
    fn new(looping: bool) -> Self {
        let ctx = NavigationContext::new(16);
        let writer = ctx.command_writer().unwrap();
        let (tx, rx) = TriggerSender::channel(8);
        let route = Route::new(vec![Waypoint::from(A), Waypoint::from(B)], looping);
        let fsm = DecisionMachine::new(ctx.clone(), writer, tx, route, FsmConfig::default()).unwrap();
        // Start 10 m from the base, facing away from it.
        let rover = Rover { pos: destination(A, 200.0, 10.0), heading_deg: 180.0 };
        Self {
            ctx,
            fsm,
            triggers: rx,
            rover,
            visits: vec![Visit { state: FsmState::Boot, commands: Vec::new() }],
            fired: Vec::new(),
            tick: 0,
        }
    }

    fn now(&self) -> OffsetDateTime {
        T0 + Duration::milliseconds(200 * self.tick)
    }

    fn step(&mut self) -> FsmState {
        let now = self.now();
        self.ctx.write_fix(GpsFix::new(self.rover.pos, now));
        let next = self.fsm.tick(now);

        while let Some(cmd) = self.ctx.dequeue_command() {
            if let Some(v) = self.visits.last_mut() {
                v.commands.push(cmd);
            }
            self.rover.apply(cmd);
        }
        if self.visits.last().map(|v| v.state) != Some(next) {
            self.visits.push(Visit { state: next, commands: Vec::new() });
        }
        while let Ok(t) = self.triggers.try_recv() {
            self.ctx.ack_trigger(t.id());
            self.fired.push(t);
        }
        self.tick += 1;
        next
    }

    fn run_until(&mut self, max_ticks: usize, done: impl Fn(&Sim) -> bool) {
        for _ in 0..max_ticks {
            self.step();
            if done(self) {
                return;
            }
        }
        panic!("did not finish within {} ticks, visits: {:?}", max_ticks, self.states());
    }

    fn states(&self) -> Vec<FsmState> {
        self.visits.iter().skip(1).map(|v| v.state).collect()
    }

    fn turns(v: &Visit) -> usize {
        v.commands.iter().filter(|c| matches!(c, MotionCommand::Turn { .. })).count()
    }
}

#[test]
fn non_looping_route_returns_home_and_syncs() {
    let mut sim = Sim::new(false);
    sim.run_until(1000, |s| s.fsm.state() == FsmState::Idle);

    use FsmState::*;
    assert_eq!(sim.states(), vec![PatrolTurn, PatrolGo, PatrolTurn, PatrolGo, ReturnHome, SyncUpload, Idle]);

    for v in &sim.visits {
        match v.state {
            PatrolTurn | ReturnHome => assert_eq!(Sim::turns(v), 1, "one turn per leg in {}", v.state),
            _ => assert_eq!(Sim::turns(v), 0, "no turn in {}", v.state),
        }
    }
    // Heading was unknown at the start: the first leg opens with a probe step.
    assert_eq!(sim.visits[1].commands.first(), Some(&MotionCommand::Forward { steps: 2 }));

    let home = sim.visits.iter().find(|v| v.state == ReturnHome).unwrap();
    assert_eq!(home.commands.last(), Some(&MotionCommand::Stop));
    assert!(matches!(sim.fired.as_slice(), [Trigger::Sync(r)] if r.reason == SyncReason::RouteComplete));
    assert!(patrol_nav::geo::haversine_m(sim.rover.pos, A) < 3.0);

    // Idle stays idle and quiet.
    for _ in 0..20 {
        assert_eq!(sim.step(), Idle);
    }
    assert!(sim.visits.last().unwrap().commands.is_empty());
}

#[test]
fn looping_route_wraps_and_syncs_at_base() {
    let mut sim = Sim::new(true);
    sim.run_until(1000, |s| !s.fired.is_empty());

    use FsmState::*;
    let states = sim.states();
    assert_eq!(&states[..5], &[PatrolTurn, PatrolGo, PatrolTurn, PatrolGo, PatrolTurn]);
    assert!(!states.contains(&ReturnHome));
    for v in sim.visits.iter().filter(|v| v.state == PatrolTurn) {
        assert!(Sim::turns(v) <= 1);
    }
    // The sync fires on the tick that also reaches the base, so the cursor has moved on.
    assert_eq!(sim.ctx.waypoint_index(), 1);
    assert!(matches!(sim.fired.as_slice(), [Trigger::Sync(r)] if r.reason == SyncReason::BaseReturn));
}

#[test]
fn violation_mid_leg_is_investigated_then_patrol_resumes() {
    let mut sim = Sim::new(true);
    sim.run_until(1000, |s| s.fsm.state() == FsmState::PatrolGo && s.ctx.waypoint_index() == 1);
    for _ in 0..3 {
        sim.step();
    }
    assert_eq!(sim.fsm.state(), FsmState::PatrolGo);

    sim.ctx.write_detection(DetectionEvent::violation("ebike_on_strip", 0.9, BoundingBox::default(), sim.now()));
    assert_eq!(sim.step(), FsmState::Investigate);
    assert_eq!(sim.visits.last().unwrap().state, FsmState::Investigate);
    assert_eq!(sim.ctx.waypoint_index(), 1);

    assert_eq!(sim.step(), FsmState::CaptureEvidence);
    let req = match sim.fired.last() {
        Some(Trigger::CaptureEvidence(r)) => r.clone(),
        other => panic!("expected capture request, got {:?}", other),
    };
    assert_eq!(req.waypoint_index, 1);
    assert_eq!(req.class_label, "ebike_on_strip");

    // Acked by the simulation as soon as it was seen.
    assert_eq!(sim.step(), FsmState::PatrolTurn);
    assert_eq!(sim.ctx.waypoint_index(), 1);

    sim.run_until(1000, |s| s.ctx.waypoint_index() == 0);
    assert!(patrol_nav::geo::haversine_m(sim.rover.pos, B) < 3.0);
}
