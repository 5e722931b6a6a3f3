//! Supervisor lifecycle state and the health restart policy

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::info;

/// Supervisor lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    Stopped,
    Starting,
    Running,
    /// At least one recent health failure, below the restart threshold
    Degraded,
    Restarting,
    Stopping,
}

impl SupervisorPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Restarting => "restarting",
            Self::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for SupervisorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one health probe result means for the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy { recovered: bool },
    Failing { consecutive: u32 },
    /// Threshold reached; the caller must request exactly one restart
    Restart,
    /// Failure ignored because a restart or shutdown is already under way
    Absorbed,
}

/// Shared supervisor counters and flags
#[derive(Debug)]
pub struct SupervisorState {
    phase: RwLock<SupervisorPhase>,
    consecutive_failures: AtomicU32,
    restarts: AtomicU32,
    /// Restarts since the last passing probe
    unrecovered_restarts: AtomicU32,
    pool_degradations: AtomicU64,
    shutting_down: AtomicBool,
    restarting: AtomicBool,
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisorState {
    pub fn new() -> Self {
        Self {
            phase: RwLock::new(SupervisorPhase::Stopped),
            consecutive_failures: AtomicU32::new(0),
            restarts: AtomicU32::new(0),
            unrecovered_restarts: AtomicU32::new(0),
            pool_degradations: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            restarting: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> SupervisorPhase {
        *self.phase.read()
    }

    pub fn set_phase(&self, next: SupervisorPhase) {
        let previous = std::mem::replace(&mut *self.phase.write(), next);
        if previous != next {
            info!(from = %previous, to = %next, "Supervisor phase changed");
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Restarts over the whole process lifetime
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Acquire)
    }

    /// Restarts with no passing probe since; this is what the restart cap limits
    pub fn unrecovered_restarts(&self) -> u32 {
        self.unrecovered_restarts.load(Ordering::Acquire)
    }

    /// Times the pool rotated with every endpoint invalid
    pub fn pool_degradations(&self) -> u64 {
        self.pool_degradations.load(Ordering::Acquire)
    }

    pub fn record_pool_degraded(&self) -> u64 {
        self.pool_degradations.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Fold one probe result into the failure counter
    ///
    /// Reaching `threshold` resets the counter and claims the single restart
    /// slot; further failures are absorbed until [`finish_restart`] releases it.
    ///
    /// [`finish_restart`]: SupervisorState::finish_restart
    pub fn record_probe(&self, ok: bool, threshold: u32) -> HealthVerdict {
        if ok {
            let previous = self.consecutive_failures.swap(0, Ordering::AcqRel);
            self.unrecovered_restarts.store(0, Ordering::Release);
            if self.phase() == SupervisorPhase::Degraded {
                self.set_phase(SupervisorPhase::Running);
            }
            return HealthVerdict::Healthy {
                recovered: previous > 0,
            };
        }

        if self.is_restarting() || self.is_shutting_down() {
            return HealthVerdict::Absorbed;
        }

        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if consecutive < threshold {
            if self.phase() == SupervisorPhase::Running {
                self.set_phase(SupervisorPhase::Degraded);
            }
            return HealthVerdict::Failing { consecutive };
        }

        self.consecutive_failures.store(0, Ordering::Release);
        if self
            .restarting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.set_phase(SupervisorPhase::Restarting);
            HealthVerdict::Restart
        } else {
            HealthVerdict::Absorbed
        }
    }

    /// Count a restart; returns the restarts since the last passing probe
    pub fn record_restart(&self) -> u32 {
        self.restarts.fetch_add(1, Ordering::AcqRel);
        self.unrecovered_restarts.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Release the restart slot and return to Running
    pub fn finish_restart(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.restarting.store(false, Ordering::Release);
        if !self.is_shutting_down() {
            self.set_phase(SupervisorPhase::Running);
        }
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.set_phase(SupervisorPhase::Stopping);
    }
}
