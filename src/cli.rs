//! Command-line overrides
//!
//! Every flag is optional; anything left unset keeps the value from the
//! environment or its default.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::Config;
use crate::error::Result;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "rotator", about, version, long_about = None)]
pub struct Cli {
    #[arg(long = "proxy-list", value_name = "PATH", help = "Proxy list file, one endpoint per line")]
    pub proxy_list: Option<PathBuf>,

    #[arg(long = "listen-host", value_name = "HOST", help = "Address the local proxy binds to")]
    pub listen_host: Option<String>,

    #[arg(long = "listen-port", value_name = "PORT", help = "Port the local proxy binds to")]
    pub listen_port: Option<u16>,

    #[arg(long = "rotation-interval", value_name = "SECS", help = "Seconds between endpoint rotations")]
    pub rotation_interval: Option<u64>,

    #[arg(long = "fetch-interval", value_name = "SECS", help = "Seconds between list refreshes")]
    pub fetch_interval: Option<u64>,

    #[arg(long = "health-interval", value_name = "SECS", help = "Seconds between health probes")]
    pub health_interval: Option<u64>,

    #[arg(
        long = "validate-before-rotate",
        value_name = "BOOL",
        help = "Probe the next endpoint before rotating to it"
    )]
    pub validate_before_rotate: Option<bool>,

    #[arg(long = "validation-timeout", value_name = "SECS", help = "Per-endpoint validation timeout")]
    pub validation_timeout: Option<u64>,

    #[arg(long = "cleanup-on-exit", help = "Delete the proxy list file on exit")]
    pub cleanup_on_exit: bool,

    #[arg(long = "fetch-command", value_name = "CMD", help = "Command that rewrites the proxy list")]
    pub fetch_command: Option<String>,

    #[arg(long = "max-restarts", value_name = "N", help = "Restarts without recovery allowed before giving up (0 = unlimited)")]
    pub max_restarts: Option<u32>,
}

impl Cli {
    /// Apply the flags that were given on top of `config`
    pub fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(path) = &self.proxy_list {
            config.pool.list_path = path.clone();
        }
        if let Some(host) = &self.listen_host {
            config.proxy.host = host.clone();
        }
        if let Some(port) = self.listen_port {
            config.proxy.port = port;
        }
        if let Some(secs) = self.rotation_interval {
            config.pool.rotation_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.fetch_interval {
            config.supervisor.fetch_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.health_interval {
            config.supervisor.health_interval = Duration::from_secs(secs);
        }
        if let Some(validate) = self.validate_before_rotate {
            config.pool.validate_before_rotate = validate;
        }
        if let Some(secs) = self.validation_timeout {
            config.pool.validation_timeout = Duration::from_secs(secs);
        }
        if self.cleanup_on_exit {
            config.supervisor.cleanup_on_exit = true;
        }
        if let Some(command) = &self.fetch_command {
            config.supervisor.fetch_command = Some(command.clone()).filter(|c| !c.trim().is_empty());
        }
        if let Some(cap) = self.max_restarts {
            config.supervisor.max_restarts = cap;
        }

        config.validate()
    }
}
