//! Fire-and-forget requests to evidence capture and upload collaborators.
//!
//! The decision machine never blocks on these. A collaborator that finishes a
//! request reports back with [`crate::NavigationContext::ack_trigger`].

use patrol_proto::GeoPoint;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvidenceRequest {
    pub id: u64,
    pub point: Option<GeoPoint>,
    #[serde(with = "time::serde::timestamp")]
    pub requested_at: OffsetDateTime,
    pub waypoint_index: usize,
    pub class_label: String,
    pub confidence: f32,
    pub frame_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncReason {
    /// Looping patrol passed back through the base.
    BaseReturn,
    /// Non-looping patrol finished and came home.
    RouteComplete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRequest {
    pub id: u64,
    pub point: Option<GeoPoint>,
    #[serde(with = "time::serde::timestamp")]
    pub requested_at: OffsetDateTime,
    pub reason: SyncReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    CaptureEvidence(EvidenceRequest),
    Sync(SyncRequest),
}

impl Trigger {
    pub fn id(&self) -> u64 {
        match self {
            Trigger::CaptureEvidence(r) => r.id,
            Trigger::Sync(r) => r.id,
        }
    }
}

/// Sending half. Allocates request ids (starting at 1).
#[derive(Debug)]
pub struct TriggerSender {
    tx: mpsc::Sender<Trigger>,
    last_id: u64,
}

impl TriggerSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Trigger>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, last_id: 0 }, rx)
    }

    pub fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    /// Never waits. Returns false when the request could not be handed over.
    pub fn fire(&self, trigger: Trigger) -> bool {
        let id = trigger.id();
        match self.tx.try_send(trigger) {
            Ok(()) => {
                debug!("trigger: sent id={}", id);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("trigger: channel full, dropped id={}", id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("trigger: no receiver, dropped id={}", id);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sync(id: u64) -> Trigger {
        Trigger::Sync(SyncRequest {
            id,
            point: None,
            requested_at: datetime!(2024-05-01 10:00:00 UTC),
            reason: SyncReason::BaseReturn,
        })
    }

    #[test]
    fn full_channel_does_not_block() {
        let (mut tx, mut rx) = TriggerSender::channel(1);
        let a = tx.next_id();
        let b = tx.next_id();
        assert_eq!((a, b), (1, 2));

        assert!(tx.fire(sync(a)));
        assert!(!tx.fire(sync(b)));
        assert_eq!(rx.try_recv().unwrap().id(), 1);
    }

    #[test]
    fn closed_channel_reports_failure() {
        let (tx, rx) = TriggerSender::channel(4);
        drop(rx);
        assert!(!tx.fire(sync(1)));
    }

    #[test]
    fn serializes_with_kind_tag() {
        let v = serde_json::to_value(sync(9)).unwrap();
        assert_eq!(v["kind"], "sync");
        assert_eq!(v["reason"], "base_return");
        assert_eq!(v["id"], 9);
    }
}
