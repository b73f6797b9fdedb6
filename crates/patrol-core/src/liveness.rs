//! Task liveness: heartbeats and a restart-or-fault supervisor.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::context::{FaultReason, NavigationContext};
use crate::shutdown::Shutdown;

/// Progress marker a task bumps on every loop iteration.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    name: Arc<str>,
    last: Arc<Mutex<Instant>>,
}

impl Heartbeat {
    pub fn new(name: &str) -> Self {
        Self { name: Arc::from(name), last: Arc::new(Mutex::new(Instant::now())) }
    }

    pub fn beat(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn age(&self) -> Duration {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).elapsed()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub check_interval: Duration,
    /// A unit whose heartbeat is older than this is considered hung.
    pub stale_after: Duration,
    pub max_restarts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(500),
            stale_after: Duration::from_secs(5),
            max_restarts: 3,
        }
    }
}

type SpawnFn = Box<dyn Fn(Heartbeat) -> JoinHandle<()> + Send>;

struct Unit {
    name: String,
    heartbeat: Heartbeat,
    spawn: SpawnFn,
    handle: JoinHandle<()>,
    restarts: u32,
    given_up: bool,
}

pub struct Supervisor {
    ctx: Arc<NavigationContext>,
    cfg: SupervisorConfig,
    units: Vec<Unit>,
}

impl Supervisor {
    pub fn new(ctx: Arc<NavigationContext>, cfg: SupervisorConfig) -> Self {
        Self { ctx, cfg, units: Vec::new() }
    }

    /// Starts a unit. `spawn` is called again for every restart.
    pub fn spawn<F>(&mut self, name: &str, spawn: F)
    where
        F: Fn(Heartbeat) -> JoinHandle<()> + Send + 'static,
    {
        let heartbeat = Heartbeat::new(name);
        let handle = spawn(heartbeat.clone());
        info!("supervisor: started `{}`", name);
        self.units.push(Unit {
            name: name.to_string(),
            heartbeat,
            spawn: Box::new(spawn),
            handle,
            restarts: 0,
            given_up: false,
        });
    }

    pub fn restarts(&self, name: &str) -> Option<u32> {
        self.units.iter().find(|u| u.name == name).map(|u| u.restarts)
    }

    /// One supervision pass. Returns the names of restarted units.
    pub fn check(&mut self) -> Vec<String> {
        let mut restarted = Vec::new();
        for unit in self.units.iter_mut().filter(|u| !u.given_up) {
            let finished = unit.handle.is_finished();
            let age = unit.heartbeat.age();
            if !finished && age <= self.cfg.stale_after {
                continue;
            }

            unit.handle.abort();
            if unit.restarts >= self.cfg.max_restarts {
                unit.given_up = true;
                error!("supervisor: `{}` failed after {} restarts, giving up", unit.name, unit.restarts);
                self.ctx.raise_fault(FaultReason::Watchdog { unit: unit.name.clone() });
                continue;
            }

            if finished {
                warn!("supervisor: `{}` exited, restarting", unit.name);
            } else {
                warn!("supervisor: `{}` silent for {:?}, restarting", unit.name, age);
            }
            unit.restarts += 1;
            unit.heartbeat.beat();
            unit.handle = (unit.spawn)(unit.heartbeat.clone());
            restarted.push(unit.name.clone());
        }
        restarted
    }

    pub async fn run(mut self, mut shutdown: Shutdown, grace: Duration) {
        let mut iv = tokio::time::interval(self.cfg.check_interval);
        iv.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = iv.tick() => { self.check(); }
            }
        }
        self.join_all(grace).await;
    }

    /// Waits up to `grace` for each unit to wind down, then aborts stragglers.
    pub async fn join_all(self, grace: Duration) {
        for mut unit in self.units {
            match tokio::time::timeout(grace, &mut unit.handle).await {
                Ok(_) => info!("supervisor: `{}` stopped", unit.name),
                Err(_) => {
                    warn!("supervisor: `{}` did not stop within {:?}, aborting", unit.name, grace);
                    unit.handle.abort();
                }
            }
        }
    }
}
