mod config;
mod outbox;
mod status;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use patrol_core::{
    run_machine, shutdown_channel, DecisionMachine, GpsTracker, NavigationContext, SharedMachine, Supervisor,
    TriggerSender,
};
use patrol_link::autodetect::{query_status, resolve_port, run_autodetect};
use patrol_link::{SerialConnector, TransportPump};
use patrol_nav::doctor as nav_doctor;
use patrol_vision::{open_source, probe_backend, run_detection};

use crate::config::{load_config, Config};

const TRIGGER_BACKLOG: usize = 16;

#[derive(Debug, Parser)]
#[command(name = "patrol", version, about = "RoboPatrol - autonomous ground patrol controller")]
struct Cli {
    #[arg(long)]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check the configuration without touching hardware.
    Doctor,
    Run,
    Link {
        #[command(subcommand)]
        cmd: LinkCmd,
    },
}

#[derive(Debug, Subcommand)]
enum LinkCmd {
    /// Probe serial ports/bauds for a controller that answers.
    Probe,
    /// Print link status (from a running `patrol run` when there is one).
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Run => run(&cfg).await?,
        Command::Link { cmd } => link_cmd(&cfg, cmd).await?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    let params = cfg.nav_params();
    let route = cfg.route();
    nav_doctor::check_nav_params(&params)?;
    nav_doctor::check_route(&route, &params)?;
    nav_doctor::check_gps_thresholds(cfg.gps.stale_timeout_s, cfg.gps.hard_limit_s, cfg.gps.heading_min_move_m)?;

    if cfg.uart.autodetect {
        info!("doctor: uart autodetect enabled (OK)");
    } else {
        anyhow::ensure!(cfg.uart.port.as_ref().map(|s| !s.is_empty()).unwrap_or(false), "uart.port missing");
        anyhow::ensure!(cfg.uart.baud.unwrap_or(0) > 0, "uart.baud invalid");
    }
    anyhow::ensure!(cfg.uart.max_line >= 16, "uart.max_line too small for a GPS line");

    anyhow::ensure!(cfg.fsm.queue_capacity > 0, "fsm.queue_capacity must be > 0");
    anyhow::ensure!(
        (0.0..=1.0).contains(&cfg.fsm.violation_min_confidence),
        "fsm.violation_min_confidence should be in [0, 1]"
    );

    // Same checks the machine does at startup, against a scratch context.
    let scratch = NavigationContext::new(cfg.fsm.queue_capacity);
    let writer = scratch.command_writer().context("scratch command writer")?;
    let (triggers, _rx) = TriggerSender::channel(1);
    DecisionMachine::new(scratch, writer, triggers, route, cfg.fsm_config()).context("fsm config")?;

    info!("doctor: vision backend {} resolves to {}", cfg.vision.backend, probe_backend(&cfg.vision));
    info!("doctor: OK");
    Ok(())
}

async fn link_cmd(cfg: &Config, cmd: LinkCmd) -> Result<()> {
    match cmd {
        LinkCmd::Probe => {
            let res = run_autodetect(&cfg.uart).await;
            if let Some((port, baud)) = &res.chosen {
                println!("CHOSEN: {} @ {}", port, baud);
            } else {
                println!("CHOSEN: none");
            }
            for p in res.probes {
                println!("probe port={} baud={} answered={} {}ms note={}", p.port, p.baud, p.answered, p.elapsed_ms, p.note);
            }
            Ok(())
        }
        LinkCmd::Status => {
            let max_age = Duration::from_secs_f64(cfg.supervisor.status_every_s.max(1.0) * 3.0);
            if let Some(path) = &cfg.supervisor.status_file {
                if let Some(report) = status::read_fresh_status(path, max_age)? {
                    println!("source=running ({})", path.display());
                    println!(
                        "state={} waypoint={} queued={}",
                        report["state"].as_str().unwrap_or("?"),
                        report["waypoint_index"],
                        report["queued"]
                    );
                    println!("fault={}", report["fault"]);
                    println!("fix={}", report["fix"]);
                    if let Some(lines) = report["link"].as_array() {
                        for l in lines.iter().filter_map(|l| l.as_str()) {
                            println!("{}", l);
                        }
                    }
                    return Ok(());
                }
            }

            let (port, baud) = resolve_port(&cfg.uart).await?;
            let mut connector = SerialConnector::new(port.clone(), baud);
            let mut link = query_status(&mut connector, Duration::from_millis(cfg.uart.probe_timeout_ms))
                .await
                .with_context(|| format!("query {} @ {}", port, baud))?;
            link.port = Some(port);
            link.baud = Some(baud);
            println!("source=direct");
            for l in patrol_link::state::summary(&link) {
                println!("{}", l);
            }
            Ok(())
        }
    }
}

async fn run(cfg: &Config) -> Result<()> {
    info!("run: starting");

    let route = cfg.route();
    nav_doctor::check_route(&route, &cfg.nav_params())?;
    let (port, baud) = resolve_port(&cfg.uart).await?;

    let ctx = NavigationContext::new(cfg.fsm.queue_capacity);
    ctx.update_link(|l| {
        l.port = Some(port.clone());
        l.baud = Some(baud);
    });

    let writer = ctx.command_writer().context("command writer already taken")?;
    let (triggers, trigger_rx) = TriggerSender::channel(TRIGGER_BACKLOG);
    let machine = DecisionMachine::new(ctx.clone(), writer, triggers, route, cfg.fsm_config())?;
    let machine: SharedMachine = Arc::new(tokio::sync::Mutex::new(machine));
    let tracker = GpsTracker::new(ctx.clone(), cfg.tracker_config());

    let (shutdown_tx, shutdown) = shutdown_channel();
    let mut sup = Supervisor::new(ctx.clone(), cfg.supervisor_config());

    {
        let shutdown = shutdown.clone();
        let tracker = tracker.clone();
        sup.spawn("gps", move |hb| tokio::spawn(tracker.clone().run(hb, shutdown.clone())));
    }
    {
        let shutdown = shutdown.clone();
        let machine = machine.clone();
        sup.spawn("fsm", move |hb| tokio::spawn(run_machine(machine.clone(), hb, shutdown.clone())));
    }
    {
        let shutdown = shutdown.clone();
        let ctx = ctx.clone();
        let pump_cfg = cfg.uart.pump_config();
        sup.spawn("link", move |hb| {
            let pump = TransportPump::new(
                SerialConnector::new(port.clone(), baud),
                ctx.clone(),
                tracker.clone(),
                pump_cfg.clone(),
            );
            tokio::spawn(pump.run(hb, shutdown.clone()))
        });
    }
    {
        let shutdown = shutdown.clone();
        let ctx = ctx.clone();
        let vision = cfg.vision.clone();
        let period = Duration::from_millis(vision.poll_ms.max(1));
        sup.spawn("vision", move |hb| {
            let (ctx, shutdown) = (ctx.clone(), shutdown.clone());
            match open_source(&vision) {
                Ok(source) => tokio::spawn(run_detection(source, ctx, period, hb, shutdown)),
                Err(e) => {
                    error!("vision: no detection source: {:#}", e);
                    tokio::spawn(async {})
                }
            }
        });
    }

    let outbox = tokio::spawn(outbox::run_outbox(trigger_rx, ctx.clone(), cfg.fsm.trigger_outbox.clone(), shutdown.clone()));
    let supervisor = tokio::spawn(sup.run(shutdown.clone(), cfg.grace()));

    let mut reset = ResetSignal::install()?;
    let mut publish = tokio::time::interval(Duration::from_secs_f64(cfg.supervisor.status_every_s.max(0.2)));
    publish.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            r = tokio::signal::ctrl_c() => {
                r.context("install ctrl-c handler")?;
                info!("run: shutdown requested");
                break;
            }
            _ = reset.recv() => {
                info!("run: reset requested");
                ctx.request_reset();
            }
            _ = publish.tick() => {
                if let Some(path) = &cfg.supervisor.status_file {
                    if let Err(e) = status::write_status(path, &ctx).await {
                        warn!("run: status file: {:#}", e);
                    }
                }
            }
        }
    }

    ctx.begin_shutdown();
    shutdown_tx.fire();
    if let Err(e) = supervisor.await {
        warn!("run: supervisor task: {}", e);
    }
    let _ = outbox.await;
    if let Some(path) = &cfg.supervisor.status_file {
        let _ = std::fs::remove_file(path);
    }
    info!("run: stopped in state {}", ctx.state());
    Ok(())
}

/// SIGUSR1 asks a faulted machine to start over.
#[cfg(unix)]
struct ResetSignal(tokio::signal::unix::Signal);

#[cfg(unix)]
impl ResetSignal {
    fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self(signal(SignalKind::user_defined1()).context("install SIGUSR1 handler")?))
    }

    async fn recv(&mut self) {
        if self.0.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
struct ResetSignal;

#[cfg(not(unix))]
impl ResetSignal {
    fn install() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}
