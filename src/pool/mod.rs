//! Upstream endpoint pool
//!
//! Holds the ordered endpoint list, the active selection and the reload
//! generation. The lock only guards index and sequence swaps; every probe and
//! file read happens outside it.

pub mod parser;
pub mod validator;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::models::ProxyEndpoint;

pub use parser::{parse_line, parse_list, read_list, ParsedList};

/// Why a proxy list could not become the pool
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("{path} contains no proxy entries")]
    Empty { path: String },

    #[error("{path}: all {lines} entries are malformed")]
    Malformed { path: String, lines: usize },

    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Pool changes broadcast to interested tasks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Reloaded { generation: u64, count: usize },
    Rotated { generation: u64, index: usize },
    /// Every entry is marked invalid; rotation advanced anyway
    Degraded { generation: u64 },
}

/// Point-in-time counts for logging
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub total: usize,
    pub valid: usize,
    pub active_index: usize,
    pub active: Option<String>,
    pub generation: u64,
    pub loaded_at: Option<DateTime<Utc>>,
}

struct PoolState {
    entries: Arc<Vec<Arc<ProxyEndpoint>>>,
    active: usize,
    generation: u64,
    loaded_at: Option<DateTime<Utc>>,
    source_path: Option<PathBuf>,
}

/// Shared upstream pool
pub struct EndpointPool {
    state: RwLock<PoolState>,
    events: broadcast::Sender<PoolEvent>,
    probe_url: Option<Url>,
}

impl EndpointPool {
    /// Create an empty pool; `probe_url` enables the HTTP stage of validation
    pub fn new(probe_url: Option<Url>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: RwLock::new(PoolState {
                entries: Arc::new(Vec::new()),
                active: 0,
                generation: 0,
                loaded_at: None,
                source_path: None,
            }),
            events,
            probe_url,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    pub fn source_path(&self) -> Option<PathBuf> {
        self.state.read().source_path.clone()
    }

    /// Read a list file and swap it in
    #[instrument(skip(self))]
    pub async fn load(&self, path: &Path) -> Result<usize, LoadError> {
        let entries = read_list(path).await?;
        self.install(entries, Some(path))
    }

    /// Replace the whole sequence at once
    ///
    /// The previously active endpoint stays active when the new list still
    /// contains it; otherwise selection restarts at the first entry. An empty
    /// list is rejected and the current pool is kept.
    pub fn reload(&self, entries: Vec<ProxyEndpoint>) -> Result<usize, LoadError> {
        self.install(entries, None)
    }

    /// Swap in `entries`; `origin` becomes the source path only on success
    fn install(&self, entries: Vec<ProxyEndpoint>, origin: Option<&Path>) -> Result<usize, LoadError> {
        let entries: Vec<Arc<ProxyEndpoint>> = entries.into_iter().map(Arc::new).collect();

        let (generation, count, active) = {
            let mut state = self.state.write();

            if entries.is_empty() {
                let path = origin
                    .or(state.source_path.as_deref())
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "reloaded list".to_string());
                return Err(LoadError::Empty { path });
            }

            if let Some(origin) = origin {
                state.source_path = Some(origin.to_path_buf());
            }

            let previous = state.entries.get(state.active).map(|e| e.key());
            let active = previous
                .and_then(|key| entries.iter().position(|e| e.key() == key))
                .unwrap_or(0);

            state.entries = Arc::new(entries);
            state.active = active;
            state.generation += 1;
            state.loaded_at = Some(Utc::now());

            (state.generation, state.entries.len(), active)
        };

        info!(generation, count, active, "Endpoint pool reloaded");
        let _ = self.events.send(PoolEvent::Reloaded { generation, count });
        Ok(count)
    }

    /// Active endpoint
    pub fn current(&self) -> Option<Arc<ProxyEndpoint>> {
        let state = self.state.read();
        state.entries.get(state.active).cloned()
    }

    /// The entry after the active one, valid or not
    pub fn peek_next(&self) -> Option<Arc<ProxyEndpoint>> {
        let state = self.state.read();
        let len = state.entries.len();
        if len == 0 {
            return None;
        }
        state.entries.get((state.active + 1) % len).cloned()
    }

    /// Advance to the next valid entry, wrapping around
    ///
    /// With every entry invalid the index still moves one step and a
    /// `Degraded` event goes out.
    pub fn rotate(&self) -> Option<Arc<ProxyEndpoint>> {
        let (endpoint, event) = {
            let mut state = self.state.write();
            let len = state.entries.len();
            if len == 0 {
                return None;
            }

            let found = (1..=len)
                .map(|step| (state.active + step) % len)
                .find(|&idx| state.entries[idx].is_valid());

            let event = match found {
                Some(idx) => {
                    state.active = idx;
                    PoolEvent::Rotated {
                        generation: state.generation,
                        index: idx,
                    }
                }
                None => {
                    state.active = (state.active + 1) % len;
                    PoolEvent::Degraded {
                        generation: state.generation,
                    }
                }
            };

            (state.entries[state.active].clone(), event)
        };

        match &event {
            PoolEvent::Degraded { .. } => {
                debug!(endpoint = %endpoint, "All endpoints invalid, rotating anyway")
            }
            _ => debug!(endpoint = %endpoint, "Rotated active endpoint"),
        }
        let _ = self.events.send(event);
        Some(endpoint)
    }

    /// First valid entry after `endpoint`, never `endpoint` itself
    ///
    /// An endpoint from an older generation is looked up by key; if it is gone
    /// the search starts from the active entry.
    pub fn next_valid_after(&self, endpoint: &ProxyEndpoint) -> Option<Arc<ProxyEndpoint>> {
        let state = self.state.read();
        let len = state.entries.len();
        if len == 0 {
            return None;
        }

        let key = endpoint.key();
        let start = state
            .entries
            .iter()
            .position(|e| e.key() == key)
            .unwrap_or(state.active + len - 1);

        (1..=len)
            .map(|step| &state.entries[(start + step) % len])
            .find(|e| e.is_valid() && e.key() != key)
            .cloned()
    }

    pub fn mark_invalid(&self, endpoint: &ProxyEndpoint) {
        if endpoint.is_valid() {
            warn!(endpoint = %endpoint, "Marking endpoint invalid");
        }
        endpoint.mark_invalid();
    }

    /// Probe an endpoint and record the outcome on it
    pub async fn validate(&self, endpoint: &ProxyEndpoint, timeout: Duration) -> bool {
        match validator::probe_endpoint(endpoint, timeout, self.probe_url.as_ref()).await {
            Ok(()) => {
                endpoint.mark_valid();
                true
            }
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "Validation failed");
                endpoint.mark_invalid();
                false
            }
        }
    }

    /// Validate every entry with at most `concurrency` probes in flight
    #[instrument(skip(self))]
    pub async fn validate_all(&self, concurrency: usize, timeout: Duration) -> usize {
        let entries = self.state.read().entries.clone();
        let total = entries.len();
        let pool = self;

        let valid = stream::iter(entries.iter().cloned())
            .map(|endpoint| async move { pool.validate(&endpoint, timeout).await })
            .buffer_unordered(concurrency.max(1))
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await;

        info!(valid, total, "Bulk validation finished");
        valid
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.read();
        let active = state.entries.get(state.active);
        PoolSnapshot {
            total: state.entries.len(),
            valid: state.entries.iter().filter(|e| e.is_valid()).count(),
            active_index: state.active,
            active: active.map(|e| e.to_string()),
            generation: state.generation,
            loaded_at: state.loaded_at,
        }
    }
}

impl std::fmt::Debug for EndpointPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("EndpointPool")
            .field("total", &snapshot.total)
            .field("active_index", &snapshot.active_index)
            .field("generation", &snapshot.generation)
            .finish()
    }
}
