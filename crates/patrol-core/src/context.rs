//! The shared navigation context.
//!
//! Every field sits behind its own lock and is replaced whole; no method holds
//! more than one field lock at a time. Components get copies through
//! [`NavigationContext::read`] or the narrow write methods below. Motion
//! commands can only be queued through the single [`CommandWriter`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use patrol_proto::{DetectionEvent, GpsFix, MotionCommand, MotorStatus};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::{info, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FsmState {
    Boot,
    PatrolTurn,
    PatrolGo,
    Investigate,
    CaptureEvidence,
    ReturnHome,
    SyncUpload,
    Idle,
    Fault,
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FsmState::Boot => "BOOT",
            FsmState::PatrolTurn => "PATROL_TURN",
            FsmState::PatrolGo => "PATROL_GO",
            FsmState::Investigate => "INVESTIGATE",
            FsmState::CaptureEvidence => "CAPTURE_EVIDENCE",
            FsmState::ReturnHome => "RETURN_HOME",
            FsmState::SyncUpload => "SYNC_UPLOAD",
            FsmState::Idle => "IDLE",
            FsmState::Fault => "FAULT",
        };
        f.write_str(s)
    }
}

/// Why the machine was (or is being asked to be) halted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FaultReason {
    GpsLost { age_s: f64 },
    LinkDown { attempts: u32 },
    Watchdog { unit: String },
    External(String),
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultReason::GpsLost { age_s } => write!(f, "GPS stale for {:.1}s", age_s),
            FaultReason::LinkDown { attempts } => write!(f, "serial link down after {} attempts", attempts),
            FaultReason::Watchdog { unit } => write!(f, "watchdog gave up on unit `{}`", unit),
            FaultReason::External(msg) => write!(f, "external: {}", msg),
        }
    }
}

/// Controller-side view of the serial link and the last reports it sent.
#[derive(Debug, Clone, Default)]
pub struct LinkState {
    pub connected: bool,
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub last_rx: Option<Instant>,
    pub last_line: Option<String>,
    pub acks: u64,
    pub errors: u64,
    pub last_error_code: Option<u8>,
    pub parse_errors: u64,
    pub reconnects: u32,
    pub booted: bool,
    pub active: Option<bool>,
    pub motors: Vec<MotorStatus>,
    pub servo: Option<(f32, bool)>,
    pub status_fields: Vec<String>,
    pub config: Vec<(String, String)>,
}

impl LinkState {
    pub fn rx_age(&self) -> Option<Duration> {
        self.last_rx.map(|t| t.elapsed())
    }
}

/// Result of queueing a motion command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Accepted,
    /// Queue was full; the oldest pending command was discarded to make room.
    DroppedOldest(MotionCommand),
    /// Shutdown has begun; nothing is queued any more.
    Rejected,
}

impl Enqueued {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Enqueued::Accepted)
    }
}

/// Consistent copy of the context. Each field is internally consistent; fields
/// may come from different moments.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub fix: Option<GpsFix>,
    pub detection: Option<DetectionEvent>,
    pub state: FsmState,
    pub waypoint_index: usize,
    pub queued: usize,
    pub fault: Option<FaultReason>,
}

pub struct NavigationContext {
    fix: RwLock<Option<GpsFix>>,
    detection: RwLock<Option<DetectionEvent>>,
    state: RwLock<FsmState>,
    waypoint_index: AtomicUsize,
    queue: Mutex<VecDeque<MotionCommand>>,
    queue_capacity: usize,
    queue_ready: Notify,
    dropped: AtomicU64,
    link: RwLock<LinkState>,
    fault: Mutex<Option<FaultReason>>,
    reset_requested: AtomicBool,
    last_ack: AtomicU64,
    writer_issued: AtomicBool,
    shutting_down: AtomicBool,
}

impl NavigationContext {
    pub fn new(queue_capacity: usize) -> Arc<Self> {
        let queue_capacity = queue_capacity.max(1);
        Arc::new(Self {
            fix: RwLock::new(None),
            detection: RwLock::new(None),
            state: RwLock::new(FsmState::Boot),
            waypoint_index: AtomicUsize::new(0),
            queue: Mutex::new(VecDeque::with_capacity(queue_capacity)),
            queue_capacity,
            queue_ready: Notify::new(),
            dropped: AtomicU64::new(0),
            link: RwLock::new(LinkState::default()),
            fault: Mutex::new(None),
            reset_requested: AtomicBool::new(false),
            last_ack: AtomicU64::new(0),
            writer_issued: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Hands out the one and only command writer. Later calls get `None`.
    pub fn command_writer(self: &Arc<Self>) -> Option<CommandWriter> {
        if self.writer_issued.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(CommandWriter { ctx: Arc::clone(self) })
    }

    pub fn read(&self) -> Snapshot {
        Snapshot {
            fix: *read(&self.fix),
            detection: read(&self.detection).clone(),
            state: *read(&self.state),
            waypoint_index: self.waypoint_index.load(Ordering::Acquire),
            queued: lock(&self.queue).len(),
            fault: lock(&self.fault).clone(),
        }
    }

    // ----- GPS -----

    /// Stores `fix` unless a fix with a later decoder timestamp is already held.
    pub fn write_fix(&self, fix: GpsFix) -> bool {
        let mut slot = write(&self.fix);
        if let Some(cur) = slot.as_ref() {
            if fix.received_at < cur.received_at {
                return false;
            }
        }
        *slot = Some(fix);
        true
    }

    pub fn latest_fix(&self) -> Option<GpsFix> {
        *read(&self.fix)
    }

    /// Replaces the held fix with an invalidated copy if it is older than
    /// `stale_timeout`. Returns the invalidated fix when that happened.
    pub fn invalidate_stale_fix(&self, now: OffsetDateTime, stale_timeout: time::Duration) -> Option<GpsFix> {
        let mut slot = write(&self.fix);
        match *slot {
            Some(fix) if fix.valid && fix.age(now) > stale_timeout => {
                let stale = fix.invalidated();
                *slot = Some(stale);
                Some(stale)
            }
            _ => None,
        }
    }

    // ----- detections -----

    /// Keeps only the newest event; an event captured earlier than the held one is ignored.
    pub fn write_detection(&self, ev: DetectionEvent) -> bool {
        let mut slot = write(&self.detection);
        if let Some(cur) = slot.as_ref() {
            if ev.captured_at < cur.captured_at {
                return false;
            }
        }
        *slot = Some(ev);
        true
    }

    // ----- decision machine owned fields -----

    pub fn state(&self) -> FsmState {
        *read(&self.state)
    }

    pub(crate) fn write_state(&self, state: FsmState) {
        *write(&self.state) = state;
    }

    pub fn waypoint_index(&self) -> usize {
        self.waypoint_index.load(Ordering::Acquire)
    }

    pub(crate) fn set_waypoint_index(&self, idx: usize) {
        self.waypoint_index.store(idx, Ordering::Release);
    }

    // ----- outbound queue -----

    fn enqueue_command(&self, cmd: MotionCommand) -> Enqueued {
        let outcome = {
            let mut q = lock(&self.queue);
            // Checked under the queue lock so nothing lands behind the final Stop.
            if self.shutting_down.load(Ordering::Acquire) {
                return Enqueued::Rejected;
            }
            let dropped = if q.len() >= self.queue_capacity { q.pop_front() } else { None };
            q.push_back(cmd);
            dropped
        };
        self.queue_ready.notify_one();
        match outcome {
            Some(old) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("queue: full ({}), dropped oldest {:?} for {:?}", self.queue_capacity, old, cmd);
                Enqueued::DroppedOldest(old)
            }
            None => Enqueued::Accepted,
        }
    }

    fn replace_queue(&self, cmd: MotionCommand) -> Enqueued {
        {
            let mut q = lock(&self.queue);
            if self.shutting_down.load(Ordering::Acquire) {
                return Enqueued::Rejected;
            }
            q.clear();
            q.push_back(cmd);
        }
        self.queue_ready.notify_one();
        Enqueued::Accepted
    }

    pub fn dequeue_command(&self) -> Option<MotionCommand> {
        lock(&self.queue).pop_front()
    }

    /// Waits for the next command. Returns `None` once shutdown has begun and the
    /// queue is empty.
    pub async fn next_command(&self) -> Option<MotionCommand> {
        loop {
            let ready = self.queue_ready.notified();
            if let Some(cmd) = self.dequeue_command() {
                return Some(cmd);
            }
            if self.shutting_down.load(Ordering::Acquire) {
                return None;
            }
            ready.await;
        }
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn dropped_commands(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    // ----- link -----

    pub fn link(&self) -> LinkState {
        read(&self.link).clone()
    }

    pub fn update_link(&self, f: impl FnOnce(&mut LinkState)) {
        f(&mut write(&self.link));
    }

    // ----- faults, resets, acknowledgements -----

    /// Asks the decision machine to halt. The first reason wins until cleared.
    pub fn raise_fault(&self, reason: FaultReason) {
        let mut slot = lock(&self.fault);
        if slot.is_none() {
            warn!("context: fault raised: {}", reason);
            *slot = Some(reason);
        }
    }

    pub fn pending_fault(&self) -> Option<FaultReason> {
        lock(&self.fault).clone()
    }

    /// External recovery from `FAULT`.
    pub fn request_reset(&self) {
        info!("context: reset requested");
        self.reset_requested.store(true, Ordering::Release);
    }

    pub(crate) fn take_reset_request(&self) -> bool {
        self.reset_requested.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn clear_fault(&self) {
        *lock(&self.fault) = None;
    }

    /// Acknowledges trigger `id` (and implicitly every earlier one).
    pub fn ack_trigger(&self, id: u64) {
        self.last_ack.fetch_max(id, Ordering::AcqRel);
    }

    pub fn is_acked(&self, id: u64) -> bool {
        self.last_ack.load(Ordering::Acquire) >= id
    }

    // ----- shutdown -----

    /// Stops accepting commands. Pending work is replaced by a final `Stop` so the
    /// pump leaves the rover halted.
    pub fn begin_shutdown(&self) {
        {
            let mut q = lock(&self.queue);
            self.shutting_down.store(true, Ordering::Release);
            q.clear();
            q.push_back(MotionCommand::Stop);
        }
        self.queue_ready.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

/// The only handle able to queue motion commands. Not `Clone`.
pub struct CommandWriter {
    ctx: Arc<NavigationContext>,
}

impl CommandWriter {
    pub fn enqueue(&self, cmd: MotionCommand) -> Enqueued {
        self.ctx.enqueue_command(cmd)
    }

    /// Discards everything pending and queues `cmd` alone.
    pub fn preempt(&self, cmd: MotionCommand) -> Enqueued {
        self.ctx.replace_queue(cmd)
    }
}

impl fmt::Debug for CommandWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandWriter").finish_non_exhaustive()
    }
}
