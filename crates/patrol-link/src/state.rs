//! Status sink: folds non-GPS telemetry into the context's [`LinkState`].

use std::time::Instant;

use patrol_core::LinkState;
use patrol_proto::Telemetry;
use tracing::{debug, info, warn};

pub fn record_line(link: &mut LinkState, line: &str) {
    link.last_rx = Some(Instant::now());
    link.last_line = Some(line.to_string());
}

pub fn apply(link: &mut LinkState, t: &Telemetry) {
    match t {
        Telemetry::Gps(_) => {}
        Telemetry::Ack => link.acks += 1,
        Telemetry::Error { code } => {
            link.errors += 1;
            link.last_error_code = Some(*code);
            warn!("link: controller rejected a command (ERR{:02})", code);
        }
        Telemetry::Boot => {
            info!("link: controller booted");
            link.booted = true;
        }
        Telemetry::Status(fields) => {
            debug!("link: status {:?}", fields);
            link.status_fields = fields.clone();
        }
        Telemetry::Config(pairs) => {
            info!("link: controller config {:?}", pairs);
            link.config = pairs.clone();
        }
        Telemetry::State { active, timed } => {
            debug!("link: state active={} timed={}", active, timed);
            link.active = Some(*active);
        }
        Telemetry::Motor(m) => match link.motors.iter_mut().find(|s| s.motor_id == m.motor_id) {
            Some(slot) => *slot = m.clone(),
            None => link.motors.push(m.clone()),
        },
        Telemetry::Servo { angle_deg, busy } => link.servo = Some((*angle_deg, *busy)),
    }
}

/// Human-readable lines for `patrol link status` and the periodic log.
pub fn summary(link: &LinkState) -> Vec<String> {
    let mut out = vec![
        format!("connected={}", link.connected),
        format!("port={:?} baud={:?}", link.port, link.baud),
        format!("last_rx_age={:?}", link.rx_age()),
        format!("last_line={:?}", link.last_line),
        format!(
            "acks={} errors={} last_error={:?} parse_errors={} reconnects={}",
            link.acks, link.errors, link.last_error_code, link.parse_errors, link.reconnects
        ),
        format!("booted={} active={:?}", link.booted, link.active),
    ];
    for m in &link.motors {
        out.push(format!(
            "motor{} target_rpm={:.1} actual_rpm={:.1} count={}",
            m.motor_id, m.target_rpm, m.actual_rpm, m.encoder_count
        ));
    }
    if let Some((angle, busy)) = link.servo {
        out.push(format!("servo angle={:.1} busy={}", angle, busy));
    }
    if !link.status_fields.is_empty() {
        out.push(format!("status={}", link.status_fields.join(",")));
    }
    for (k, v) in &link.config {
        out.push(format!("config {}={}", k, v));
    }
    out
}
