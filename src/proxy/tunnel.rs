//! CONNECT tunnel implementation for HTTPS proxying
//!
//! Handles bidirectional data transfer between client and upstream, with an
//! idle timeout shared by both directions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Notify};
use tracing::{debug, instrument};

const RELAY_BUFFER: usize = 16 * 1024;

/// How a tunnel ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelEnd {
    /// Both directions reached EOF or an error
    Closed,
    /// No bytes moved in either direction for the idle timeout
    Idle,
    /// The server was stopping and the drain period ran out
    ForceClosed,
}

/// Byte counts and termination reason for a finished tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    pub sent: u64,
    pub received: u64,
    pub end: TunnelEnd,
}

/// Last time any byte crossed the tunnel, in milliseconds since it opened
struct Activity {
    opened: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            opened: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.opened.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.opened.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

/// Handles CONNECT tunnels
pub struct TunnelHandler;

impl TunnelHandler {
    /// Relay bytes both ways until both directions finish, the tunnel goes idle,
    /// or `force_close` flips to true
    #[instrument(skip(client, server, force_close))]
    pub async fn relay<C, S>(
        client: C,
        server: S,
        idle_timeout: Duration,
        mut force_close: watch::Receiver<bool>,
    ) -> TunnelStats
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let activity = Arc::new(Activity::new());
        let sent = Arc::new(AtomicU64::new(0));
        let received = Arc::new(AtomicU64::new(0));

        let transfer = async {
            tokio::join!(
                pump(client_read, server_write, &activity, &sent),
                pump(server_read, client_write, &activity, &received),
            )
        };

        let watchdog = async {
            loop {
                let idle = activity.idle_for();
                if idle >= idle_timeout {
                    break;
                }
                tokio::time::sleep(idle_timeout - idle).await;
            }
        };

        let end = tokio::select! {
            (up, down) = transfer => {
                if let Err(e) = up {
                    debug!("Client to upstream relay ended: {}", e);
                }
                if let Err(e) = down {
                    debug!("Upstream to client relay ended: {}", e);
                }
                TunnelEnd::Closed
            }
            _ = watchdog => TunnelEnd::Idle,
            _ = force_close.wait_for(|closed| *closed) => TunnelEnd::ForceClosed,
        };

        let stats = TunnelStats {
            sent: sent.load(Ordering::Relaxed),
            received: received.load(Ordering::Relaxed),
            end,
        };

        debug!(
            bytes_sent = stats.sent,
            bytes_received = stats.received,
            end = ?stats.end,
            "Tunnel closed"
        );

        stats
    }
}

/// Copy one direction, half-closing the writer when the reader finishes
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    activity: &Activity,
    counter: &AtomicU64,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];

    let result = async {
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            writer.write_all(&buf[..n]).await?;
            writer.flush().await?;
            counter.fetch_add(n as u64, Ordering::Relaxed);
            activity.touch();
        }
    }
    .await;

    let _ = writer.shutdown().await;
    result
}

/// Counts live client sessions so a stopping server can wait for them
#[derive(Debug, Default)]
pub struct SessionTracker {
    active: AtomicU64,
    idle: Notify,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    /// Wait until no session is active
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Guard for tracking a live session; released on drop
pub struct SessionGuard {
    tracker: Arc<SessionTracker>,
}

impl SessionGuard {
    pub fn new(tracker: Arc<SessionTracker>) -> Self {
        tracker.active.fetch_add(1, Ordering::AcqRel);
        Self { tracker }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}
