//! Fetch worker
//!
//! Periodically asks a [`Fetcher`] for a fresh endpoint list and hot-reloads
//! the pool with it. A failed fetch never touches the current pool.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::{cancelled, WorkerState};
use crate::config::Config;
use crate::error::{Result, RotatorError};
use crate::models::ProxyEndpoint;
use crate::pool::{read_list, EndpointPool};

/// Source of fresh endpoint lists
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Produce the current endpoint list
    ///
    /// Errors are reported as [`RotatorError::Fetch`] and are never fatal to a
    /// running pool.
    async fn fetch(&self) -> Result<Vec<ProxyEndpoint>>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Re-reads a list file maintained by some external tool
pub struct FileFetcher {
    path: PathBuf,
}

impl FileFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(&self) -> Result<Vec<ProxyEndpoint>> {
        read_list(&self.path)
            .await
            .map_err(|e| RotatorError::Fetch(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Runs an external command that rewrites the list file, then reads it
pub struct CommandFetcher {
    command: String,
    list_path: PathBuf,
    timeout: Duration,
}

impl CommandFetcher {
    pub fn new(command: impl Into<String>, list_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            list_path: list_path.into(),
            timeout,
        }
    }

    fn shell(&self) -> Command {
        #[cfg(unix)]
        let mut cmd = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.command);
            cmd
        };

        #[cfg(not(unix))]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(&self.command);
            cmd
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Fetcher for CommandFetcher {
    #[instrument(skip(self), fields(command = %self.command))]
    async fn fetch(&self) -> Result<Vec<ProxyEndpoint>> {
        let output = timeout(self.timeout, self.shell().output())
            .await
            .map_err(|_| {
                RotatorError::Fetch(format!("`{}` timed out after {:?}", self.command, self.timeout))
            })?
            .map_err(|e| RotatorError::Fetch(format!("cannot run `{}`: {}", self.command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RotatorError::Fetch(format!(
                "`{}` exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        debug!(
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            "Fetch command finished"
        );

        read_list(&self.list_path)
            .await
            .map_err(|e| RotatorError::Fetch(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "command"
    }
}

/// Periodic list refresh
pub struct FetchWorker {
    pool: Arc<EndpointPool>,
    fetcher: Arc<dyn Fetcher>,
    validate: bool,
    validation_concurrency: usize,
    validation_timeout: Duration,
    state: WorkerState,
}

impl FetchWorker {
    pub fn new(pool: Arc<EndpointPool>, fetcher: Arc<dyn Fetcher>, config: &Config) -> Self {
        Self {
            pool,
            fetcher,
            validate: config.pool.validate_before_rotate,
            validation_concurrency: config.pool.validation_concurrency,
            validation_timeout: config.pool.validation_timeout,
            state: WorkerState::new("fetch", config.supervisor.fetch_interval),
        }
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Run the fetch worker (call in a spawned task); the first fetch is immediate
    #[instrument(skip(self, shutdown), fields(fetcher = self.fetcher.name()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting fetch worker with {}s interval",
            self.state.interval().as_secs_f64()
        );

        let mut ticker = interval(self.state.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.fetch_once().await;
                }
                changed = shutdown.changed() => {
                    if cancelled(changed, &shutdown) {
                        info!("Fetch worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Fetch and reload once, keeping the current pool on any failure
    pub async fn fetch_once(&self) -> Result<usize> {
        self.state.record_run();

        let entries = match self.fetcher.fetch().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Fetch failed, keeping current pool");
                return Err(e);
            }
        };

        let count = self.pool.reload(entries).map_err(|e| {
            warn!(error = %e, "Fetched list rejected, keeping current pool");
            RotatorError::Fetch(e.to_string())
        })?;

        if self.validate {
            self.pool
                .validate_all(self.validation_concurrency, self.validation_timeout)
                .await;
        }

        let snapshot = self.pool.snapshot();
        info!(
            total = snapshot.total,
            valid = snapshot.valid,
            generation = snapshot.generation,
            "Endpoint list refreshed"
        );
        Ok(count)
    }
}
