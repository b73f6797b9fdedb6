pub mod context;
pub mod fsm;
pub mod liveness;
pub mod shutdown;
pub mod tracker;
pub mod triggers;

pub use context::{
    CommandWriter, Enqueued, FaultReason, FsmState, LinkState, NavigationContext, Snapshot, DEFAULT_QUEUE_CAPACITY,
};
pub use fsm::{run_machine, DecisionMachine, FsmConfig, SharedMachine};
pub use liveness::{Heartbeat, Supervisor, SupervisorConfig};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
pub use tracker::{GpsTracker, TrackerConfig};
pub use triggers::{EvidenceRequest, SyncReason, SyncRequest, Trigger, TriggerSender};
