//! Background reconciliation loop
//!
//! Every tick steps each active service once. Services are independent, so
//! their steps run concurrently on the blocking pool; a single service is
//! never stepped twice at the same time since its lock is held for the
//! whole step.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::orchestrator::Orchestrator;

/// Called before each tick, e.g. to advance a simulated cloud
pub type TickHook = Box<dyn Fn() + Send + Sync>;

pub struct Reconciler {
    orchestrator: Arc<Orchestrator>,
    period: Duration,
    before_tick: Option<TickHook>,
}

/// Running reconciler task
pub struct ReconcilerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Stop after the current tick and wait for the task to exit
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Reconciler task panicked");
        }
    }
}

impl Reconciler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let period = orchestrator.config().poll_interval();
        Self {
            orchestrator,
            period,
            before_tick: None,
        }
    }

    pub fn before_tick(mut self, hook: TickHook) -> Self {
        self.before_tick = Some(hook);
        self
    }

    pub fn spawn(self) -> ReconcilerHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        ReconcilerHandle { shutdown, task }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(period_ms = self.period.as_millis() as u64, "Reconciler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Some(hook) = &self.before_tick {
                hook();
            }
            self.tick().await;
        }

        tracing::info!("Reconciler stopped");
    }

    /// Step every active service once, concurrently
    pub async fn tick(&self) -> usize {
        let mut steps = JoinSet::new();
        for id in self.orchestrator.active_service_ids() {
            let orch = Arc::clone(&self.orchestrator);
            steps.spawn_blocking(move || (id, orch.reconcile_service(id)));
        }

        let mut stepped = 0;
        while let Some(joined) = steps.join_next().await {
            match joined {
                Ok((id, Ok(state))) => {
                    stepped += 1;
                    tracing::trace!(service = id, state = %state, "Reconciled");
                }
                Ok((id, Err(e))) => {
                    tracing::error!(service = id, error = %e, "Reconciliation step failed")
                }
                Err(e) => tracing::error!(error = %e, "Reconciliation task panicked"),
            }
        }
        stepped
    }
}
