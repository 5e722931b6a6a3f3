//! Health probe against the running forwarding server

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use url::Url;

use crate::proxy::{probe_through, ServerControl};
use crate::services::HealthProbe;

/// Slot holding the control view of whichever server instance is current
pub type ServerSlot = Arc<RwLock<Option<ServerControl>>>;

/// Checks the server is listening, then sends a request through it
pub struct LocalProbe {
    server: ServerSlot,
    target: Url,
    timeout: Duration,
}

impl LocalProbe {
    pub fn new(server: ServerSlot, target: Url, timeout: Duration) -> Self {
        Self {
            server,
            target,
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for LocalProbe {
    async fn check(&self) -> std::result::Result<(), String> {
        let control = self
            .server
            .read()
            .clone()
            .ok_or_else(|| "forwarding server is not running".to_string())?;

        if !control.is_listening() {
            return Err(format!("{} is no longer listening", control.local_addr()));
        }

        match probe_through(control.local_addr(), &self.target, self.timeout).await {
            Ok(status) if status.is_success() => Ok(()),
            Ok(status) => Err(format!("request through local proxy answered {}", status)),
            Err(e) => Err(e.to_string()),
        }
    }
}
