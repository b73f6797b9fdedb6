use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use patrol_core::{FaultReason, FsmState, NavigationContext};
use patrol_proto::GpsFix;
use serde::Serialize;
use time::OffsetDateTime;

/// What `patrol run` publishes for `patrol link status`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    #[serde(with = "time::serde::timestamp")]
    pub written_at: OffsetDateTime,
    pub state: FsmState,
    pub waypoint_index: usize,
    pub queued: usize,
    pub dropped_commands: u64,
    pub fault: Option<FaultReason>,
    pub fix: Option<GpsFix>,
    pub link: Vec<String>,
}

impl StatusReport {
    pub fn capture(ctx: &NavigationContext) -> Self {
        let snap = ctx.read();
        Self {
            written_at: OffsetDateTime::now_utc(),
            state: snap.state,
            waypoint_index: snap.waypoint_index,
            queued: snap.queued,
            dropped_commands: ctx.dropped_commands(),
            fault: snap.fault,
            fix: snap.fix,
            link: patrol_link::state::summary(&ctx.link()),
        }
    }
}

/// Replaces `path` with a fresh report (write to a sibling, then rename).
pub async fn write_status(path: &Path, ctx: &NavigationContext) -> Result<()> {
    let body = serde_json::to_vec_pretty(&StatusReport::capture(ctx))?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, body).await.with_context(|| format!("write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path).await.with_context(|| format!("rename to {}", path.display()))?;
    Ok(())
}

/// The last published report, if one exists and is younger than `max_age`.
pub fn read_fresh_status(path: &Path, max_age: Duration) -> Result<Option<serde_json::Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let v: serde_json::Value = serde_json::from_str(&raw).context("parse status file")?;
    let written = v.get("written_at").and_then(|w| w.as_i64()).context("status file has no written_at")?;
    let age = OffsetDateTime::now_utc().unix_timestamp() - written;
    if age < 0 || age as u64 > max_age.as_secs() {
        return Ok(None);
    }
    Ok(Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn published_report_reads_back() {
        let path = std::env::temp_dir().join(format!("patrol-status-{}.json", std::process::id()));
        let ctx = NavigationContext::new(4);
        ctx.update_link(|l| {
            l.connected = true;
            l.acks = 7;
        });
        ctx.raise_fault(FaultReason::LinkDown { attempts: 5 });

        write_status(&path, &ctx).await.unwrap();
        let v = read_fresh_status(&path, Duration::from_secs(60)).unwrap().expect("fresh");
        assert_eq!(v["state"], "BOOT");
        assert!(v["fault"].to_string().contains("LinkDown"));
        let link: Vec<String> = serde_json::from_value(v["link"].clone()).unwrap();
        assert!(link.iter().any(|l| l.starts_with("acks=7 ")));

        let _ = std::fs::remove_file(&path);
        assert!(read_fresh_status(&path, Duration::from_secs(60)).unwrap().is_none());
    }
}
