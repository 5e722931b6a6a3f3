//! Background services

pub mod fetch;
pub mod health;
pub mod rotation;

pub use fetch::{CommandFetcher, FetchWorker, Fetcher, FileFetcher};
pub use health::{HealthProbe, HealthWorker};
pub use rotation::RotationTimer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;

/// Bookkeeping shared by the periodic workers
#[derive(Debug)]
pub struct WorkerState {
    name: &'static str,
    interval: Duration,
    last_run: RwLock<Option<DateTime<Utc>>>,
    runs: AtomicU64,
}

impl WorkerState {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            last_run: RwLock::new(None),
            runs: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.last_run.read()
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn record_run(&self) {
        *self.last_run.write() = Some(Utc::now());
        self.runs.fetch_add(1, Ordering::Relaxed);
    }
}

/// True once the shared cancellation flag is set or its sender is gone
pub(crate) fn cancelled(changed: Result<(), watch::error::RecvError>, shutdown: &watch::Receiver<bool>) -> bool {
    changed.is_err() || *shutdown.borrow()
}
