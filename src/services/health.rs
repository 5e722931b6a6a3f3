//! Health worker
//!
//! Periodically checks that the forwarding server still answers and feeds the
//! result into the supervisor's restart policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::{cancelled, WorkerState};
use crate::config::SupervisorConfig;
use crate::supervisor::{HealthVerdict, SupervisorCommand, SupervisorState};

/// One liveness check of the forwarding server
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Err` carries the reason the server is considered unhealthy
    async fn check(&self) -> std::result::Result<(), String>;
}

/// Periodic health probing
pub struct HealthWorker {
    probe: Arc<dyn HealthProbe>,
    supervisor: Arc<SupervisorState>,
    commands: mpsc::Sender<SupervisorCommand>,
    threshold: u32,
    initial_delay: Duration,
    state: WorkerState,
}

impl HealthWorker {
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        supervisor: Arc<SupervisorState>,
        commands: mpsc::Sender<SupervisorCommand>,
        config: &SupervisorConfig,
    ) -> Self {
        Self {
            probe,
            supervisor,
            commands,
            threshold: config.failure_threshold,
            initial_delay: config.health_initial_delay,
            state: WorkerState::new("health", config.health_interval),
        }
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Run the health worker (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting health worker with {}s interval after {}s warm-up",
            self.state.interval().as_secs_f64(),
            self.initial_delay.as_secs_f64()
        );

        tokio::select! {
            _ = sleep(self.initial_delay) => {}
            _ = shutdown.wait_for(|stop| *stop) => {
                info!("Health worker shutting down");
                return;
            }
        }

        let mut ticker = interval(self.state.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_once().await;
                }
                changed = shutdown.changed() => {
                    if cancelled(changed, &shutdown) {
                        info!("Health worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe once and act on the verdict
    pub async fn check_once(&self) -> HealthVerdict {
        self.state.record_run();

        let result = self.probe.check().await;
        let verdict = self.supervisor.record_probe(result.is_ok(), self.threshold);

        match (&verdict, result) {
            (HealthVerdict::Healthy { recovered: true }, _) => {
                info!("Forwarding server healthy again");
            }
            (HealthVerdict::Healthy { recovered: false }, _) => {
                debug!("Health probe passed");
            }
            (HealthVerdict::Failing { consecutive }, Err(reason)) => {
                warn!(
                    consecutive = *consecutive,
                    threshold = self.threshold,
                    reason = %reason,
                    "Health probe failed"
                );
            }
            (HealthVerdict::Restart, Err(reason)) => {
                error!(reason = %reason, "Health threshold reached, requesting restart");
                if self
                    .commands
                    .send(SupervisorCommand::Restart { reason })
                    .await
                    .is_err()
                {
                    warn!("Supervisor is gone, restart request dropped");
                }
            }
            (HealthVerdict::Absorbed, Err(reason)) => {
                debug!(reason = %reason, "Health failure absorbed during restart or shutdown");
            }
            (_, Ok(())) => {}
        }

        verdict
    }
}
