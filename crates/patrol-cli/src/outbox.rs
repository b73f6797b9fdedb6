use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use patrol_core::{NavigationContext, Shutdown, Trigger};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Hands capture/sync triggers to the uploader side.
///
/// Each trigger becomes one JSON line in `path` (when set) and is acknowledged
/// once it is written, which lets the decision machine leave `CAPTURE_EVIDENCE`
/// or `SYNC_UPLOAD` before its timeout.
pub async fn run_outbox(
    mut rx: mpsc::Receiver<Trigger>,
    ctx: Arc<NavigationContext>,
    path: Option<PathBuf>,
    mut shutdown: Shutdown,
) {
    loop {
        let trigger = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            t = rx.recv() => match t {
                Some(t) => t,
                None => break,
            },
        };
        info!("outbox: {:?}", trigger);
        match &path {
            Some(p) => match append(p, &trigger).await {
                Ok(()) => ctx.ack_trigger(trigger.id()),
                Err(e) => warn!("outbox: trigger {} not delivered: {:#}", trigger.id(), e),
            },
            None => ctx.ack_trigger(trigger.id()),
        }
    }
    debug!("outbox: stopped");
}

async fn append(path: &Path, trigger: &Trigger) -> Result<()> {
    let mut line = serde_json::to_vec(trigger)?;
    line.push(b'\n');
    let mut f = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    f.write_all(&line).await?;
    f.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use patrol_core::{shutdown_channel, SyncReason, SyncRequest, TriggerSender};
    use time::OffsetDateTime;

    #[tokio::test]
    async fn written_triggers_are_acked() {
        let path = std::env::temp_dir().join(format!("patrol-outbox-{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let ctx = NavigationContext::new(4);
        let (mut sender, rx) = TriggerSender::channel(4);
        let (trigger, shutdown) = shutdown_channel();
        let task = tokio::spawn(run_outbox(rx, ctx.clone(), Some(path.clone()), shutdown));

        let id = sender.next_id();
        assert!(sender.fire(Trigger::Sync(SyncRequest {
            id,
            point: None,
            requested_at: OffsetDateTime::now_utc(),
            reason: SyncReason::RouteComplete,
        })));

        for _ in 0..100 {
            if ctx.is_acked(id) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(ctx.is_acked(id));
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("route_complete"));

        trigger.fire();
        task.await.unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
