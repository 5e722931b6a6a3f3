//! Supervisor
//!
//! Owns the forwarding server lifecycle and the three periodic workers:
//! startup ordering, health-driven restarts and graceful shutdown.

mod probe;
mod state;

pub use probe::{LocalProbe, ServerSlot};
pub use state::{HealthVerdict, SupervisorPhase, SupervisorState};

use std::future::Future;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::error::{Result, RotatorError};
use crate::pool::{EndpointPool, LoadError, PoolEvent};
use crate::proxy::{ForwardingServer, ServerControl, ServerHandle};
use crate::services::{FetchWorker, Fetcher, HealthProbe, HealthWorker, RotationTimer};

/// How long a cancelled worker gets before it is aborted
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Rebind attempts during a restart
const REBIND_ATTEMPTS: u32 = 5;

/// Requests sent to the supervisor control task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCommand {
    Restart { reason: String },
}

/// Supervisor for the forwarding server and its workers
pub struct Supervisor {
    config: Config,
    pool: Arc<EndpointPool>,
    fetcher: Arc<dyn Fetcher>,
    probe: Option<Arc<dyn HealthProbe>>,
    state: Arc<SupervisorState>,
    server: ServerSlot,
}

impl Supervisor {
    pub fn new(config: Config, fetcher: Arc<dyn Fetcher>) -> Self {
        let pool = Arc::new(EndpointPool::new(config.pool.validation_url.clone()));
        Self {
            config,
            pool,
            fetcher,
            probe: None,
            state: Arc::new(SupervisorState::new()),
            server: Arc::new(RwLock::new(None)),
        }
    }

    /// Replace the default loopback health probe
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn state(&self) -> Arc<SupervisorState> {
        self.state.clone()
    }

    pub fn pool(&self) -> Arc<EndpointPool> {
        self.pool.clone()
    }

    /// Control view of the server instance currently bound, if any
    pub fn server(&self) -> Option<ServerControl> {
        self.server.read().clone()
    }

    /// Load the mandatory proxy list
    ///
    /// When the list is unusable and a fetch command is configured, one fetch
    /// is attempted before giving up.
    #[instrument(skip(self), fields(path = %self.config.pool.list_path.display()))]
    pub async fn prepare_pool(&self) -> Result<usize> {
        let path = &self.config.pool.list_path;

        let err = match self.pool.load(path).await {
            Ok(count) => {
                info!(count, "Loaded proxy list");
                return Ok(count);
            }
            Err(err) => err,
        };

        if self.config.supervisor.fetch_command.is_some() {
            warn!(error = %err, "Proxy list unusable, attempting bootstrap fetch");
            match self.fetcher.fetch().await {
                Ok(entries) => {
                    let count = self.pool.reload(entries)?;
                    info!(count, "Loaded proxy list from bootstrap fetch");
                    return Ok(count);
                }
                Err(e) => error!(error = %e, "Bootstrap fetch failed"),
            }
        }

        match err {
            LoadError::Unreadable { path, source } if source.kind() == ErrorKind::NotFound => Err(
                RotatorError::InvalidConfig(format!("proxy list {} does not exist", path)),
            ),
            other => Err(other.into()),
        }
    }

    /// Run until `signal` resolves or a fatal error occurs
    #[instrument(skip(self, signal))]
    pub async fn run<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.state.set_phase(SupervisorPhase::Starting);

        let server = ForwardingServer::new(self.config.proxy.clone(), self.pool.clone());
        let startup = async {
            self.prepare_pool().await?;
            server.bind().await
        };
        let mut handle = match startup.await {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "Startup failed");
                self.state.set_phase(SupervisorPhase::Stopped);
                return Err(e);
            }
        };
        *self.server.write() = handle.as_ref().map(ServerHandle::control);

        let mut pool_events = self.pool.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (command_tx, mut command_rx) = mpsc::channel(8);
        let workers = self.spawn_workers(shutdown_rx, command_tx);

        self.state.set_phase(SupervisorPhase::Running);
        let snapshot = self.pool.snapshot();
        info!(
            endpoints = snapshot.total,
            active = snapshot.active.unwrap_or_default(),
            "Supervisor running"
        );

        tokio::pin!(signal);
        let outcome = loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown signal received");
                    break Ok(());
                }
                Some(command) = command_rx.recv() => match command {
                    SupervisorCommand::Restart { reason } => {
                        if let Err(e) = self.restart(&server, &mut handle, &reason).await {
                            break Err(e);
                        }
                    }
                },
                event = pool_events.recv() => match event {
                    Ok(event) => self.observe_pool_event(event),
                    Err(RecvError::Lagged(missed)) => debug!(missed, "Pool events dropped"),
                    Err(RecvError::Closed) => {}
                },
            }
        };

        self.shutdown(shutdown_tx, handle, workers).await;
        outcome
    }

    fn observe_pool_event(&self, event: PoolEvent) {
        match event {
            PoolEvent::Degraded { generation } => {
                let total = self.state.record_pool_degraded();
                warn!(generation, total, "Every upstream endpoint is invalid");
            }
            PoolEvent::Reloaded { generation, count } => {
                debug!(generation, count, "Pool reloaded");
            }
            PoolEvent::Rotated { generation, index } => {
                debug!(generation, index, "Pool rotated");
            }
        }
    }

    fn spawn_workers(
        &self,
        shutdown: watch::Receiver<bool>,
        commands: mpsc::Sender<SupervisorCommand>,
    ) -> Vec<(&'static str, JoinHandle<()>)> {
        let rotation = RotationTimer::new(self.pool.clone(), &self.config.pool);
        let fetch = FetchWorker::new(self.pool.clone(), self.fetcher.clone(), &self.config);

        let probe = self.probe.clone().unwrap_or_else(|| {
            Arc::new(LocalProbe::new(
                self.server.clone(),
                self.config.supervisor.health_url.clone(),
                self.config.supervisor.health_timeout,
            ))
        });
        let health = HealthWorker::new(probe, self.state.clone(), commands, &self.config.supervisor);

        let rotation_shutdown = shutdown.clone();
        let fetch_shutdown = shutdown.clone();
        vec![
            (
                "rotation",
                tokio::spawn(async move { rotation.run(rotation_shutdown).await }),
            ),
            (
                "fetch",
                tokio::spawn(async move { fetch.run(fetch_shutdown).await }),
            ),
            (
                "health",
                tokio::spawn(async move { health.run(shutdown).await }),
            ),
        ]
    }

    /// Stop the current server and bind a fresh one with the same configuration
    ///
    /// Only exceeding the restart cap is an error; a failed rebind leaves the
    /// slot empty so the next health probes fail and trigger another attempt.
    async fn restart(
        &self,
        server: &ForwardingServer,
        handle: &mut Option<ServerHandle>,
        reason: &str,
    ) -> Result<()> {
        let unrecovered = self.state.record_restart();
        let cap = self.config.supervisor.max_restarts;
        if cap > 0 && unrecovered > cap {
            error!(unrecovered, cap, "Restart cap exceeded without recovery");
            return Err(RotatorError::RestartCapExceeded { restarts: cap });
        }

        warn!(
            unrecovered,
            total = self.state.restarts(),
            reason,
            "Restarting forwarding server"
        );
        *self.server.write() = None;
        if let Some(old) = handle.take() {
            old.stop(self.config.supervisor.restart_drain).await;
        }

        for attempt in 1..=REBIND_ATTEMPTS {
            match server.bind().await {
                Ok(fresh) => {
                    *self.server.write() = Some(fresh.control());
                    *handle = Some(fresh);
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Rebind failed");
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
            }
        }

        if handle.is_none() {
            error!("Forwarding server could not be rebound; waiting for the next health cycle");
        }

        self.state.finish_restart();
        Ok(())
    }

    async fn shutdown(
        &self,
        shutdown_tx: watch::Sender<bool>,
        handle: Option<ServerHandle>,
        workers: Vec<(&'static str, JoinHandle<()>)>,
    ) {
        self.state.begin_shutdown();
        let _ = shutdown_tx.send(true);

        *self.server.write() = None;
        if let Some(handle) = handle {
            handle.stop(self.config.supervisor.shutdown_grace).await;
        }

        for (name, mut task) in workers {
            match tokio::time::timeout(WORKER_JOIN_TIMEOUT, &mut task).await {
                Ok(Ok(())) => debug!(worker = name, "Worker stopped"),
                Ok(Err(e)) => warn!(worker = name, error = %e, "Worker ended abnormally"),
                Err(_) => {
                    warn!(worker = name, "Worker did not stop in time, aborting");
                    task.abort();
                }
            }
        }

        if self.config.supervisor.cleanup_on_exit {
            self.cleanup_list().await;
        }

        self.state.set_phase(SupervisorPhase::Stopped);
        info!("Supervisor stopped");
    }

    async fn cleanup_list(&self) {
        let path = &self.config.pool.list_path;
        match tokio::fs::remove_file(path).await {
            Ok(()) => info!(path = %path.display(), "Removed proxy list"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove proxy list"),
        }
    }
}
