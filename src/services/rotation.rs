//! Rotation timer
//!
//! Advances the pool's active endpoint on a fixed interval, optionally probing
//! the candidate first so a dead endpoint is skipped instead of selected.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument};

use super::{cancelled, WorkerState};
use crate::config::PoolConfig;
use crate::models::ProxyEndpoint;
use crate::pool::EndpointPool;

/// Periodic rotation of the active endpoint
pub struct RotationTimer {
    pool: Arc<EndpointPool>,
    validate: bool,
    validation_timeout: Duration,
    state: WorkerState,
}

impl RotationTimer {
    pub fn new(pool: Arc<EndpointPool>, config: &PoolConfig) -> Self {
        Self {
            pool,
            validate: config.validate_before_rotate,
            validation_timeout: config.validation_timeout,
            state: WorkerState::new("rotation", config.rotation_interval),
        }
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Run the rotation timer (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting rotation timer with {}s interval",
            self.state.interval().as_secs_f64()
        );

        let mut ticker = interval(self.state.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // Skip immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if cancelled(changed, &shutdown) {
                        info!("Rotation timer shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One rotation step; returns the endpoint that is now active
    pub async fn tick(&self) -> Option<Arc<ProxyEndpoint>> {
        self.state.record_run();

        if self.validate {
            // Probe outside the pool lock; a success can revive an invalid entry
            if let Some(candidate) = self.pool.peek_next() {
                let ok = self.pool.validate(&candidate, self.validation_timeout).await;
                debug!(candidate = %candidate, ok, "Validated rotation candidate");
            }
        }

        let active = self.pool.rotate()?;
        info!(endpoint = %active, "Active endpoint rotated");
        Some(active)
    }
}
