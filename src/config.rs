use crate::error::{Result, RotatorError};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Smallest request head buffer hyper accepts
pub const MIN_HEADER_BYTES: usize = 8192;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Forwarding server configuration
    pub proxy: ProxyServerConfig,
    /// Endpoint pool and rotation configuration
    pub pool: PoolConfig,
    /// Supervisor and worker configuration
    pub supervisor: SupervisorConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Port for the forwarding server (default: 8888)
    pub port: u16,
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,
    /// Upstream connect timeout
    pub connect_timeout: Duration,
    /// Upstream response timeout for plain requests
    pub request_timeout: Duration,
    /// Time allowed for a client to send a complete request head
    pub header_read_timeout: Duration,
    /// Maximum buffered request head size
    pub max_header_bytes: usize,
    /// Tunnels with no traffic either way for this long are closed
    pub tunnel_idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Proxy list file, one endpoint per line
    pub list_path: PathBuf,
    /// Time between rotations (default: 9s)
    pub rotation_interval: Duration,
    /// Probe the next endpoint before rotating to it
    pub validate_before_rotate: bool,
    /// Per-endpoint validation timeout
    pub validation_timeout: Duration,
    /// URL fetched through an endpoint during validation; TCP check only when unset
    pub validation_url: Option<Url>,
    /// Concurrent probes during bulk validation
    pub validation_concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time between list refreshes (default: 3600s)
    pub fetch_interval: Duration,
    /// External command that rewrites the proxy list
    pub fetch_command: Option<String>,
    /// Upper bound on one fetch command run
    pub fetch_timeout: Duration,
    /// Time between health probes (default: 60s)
    pub health_interval: Duration,
    /// Delay before the first health probe
    pub health_initial_delay: Duration,
    /// Timeout for one health probe
    pub health_timeout: Duration,
    /// Echo target requested through the local server by the health probe
    pub health_url: Url,
    /// Consecutive failures that trigger a restart
    pub failure_threshold: u32,
    /// Restarts without a passing probe in between before giving up (0 = unlimited)
    pub max_restarts: u32,
    /// In-flight session drain during a restart
    pub restart_drain: Duration,
    /// In-flight session drain during shutdown
    pub shutdown_grace: Duration,
    /// Delete the proxy list file on exit
    pub cleanup_on_exit: bool,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Config {
            proxy: ProxyServerConfig {
                port: get_env_or("PROXY_PORT", "8888").parse().map_err(|_| {
                    RotatorError::InvalidConfig("PROXY_PORT must be a valid port number".into())
                })?,
                host: get_env_or("PROXY_HOST", "127.0.0.1"),
                connect_timeout: get_secs("PROXY_CONNECT_TIMEOUT", 10)?,
                request_timeout: get_secs("PROXY_REQUEST_TIMEOUT", 30)?,
                header_read_timeout: get_secs("PROXY_HEADER_READ_TIMEOUT", 10)?,
                max_header_bytes: get_env_or("PROXY_MAX_HEADER_BYTES", "16384")
                    .parse::<usize>()
                    .map_err(|_| {
                        RotatorError::InvalidConfig(
                            "PROXY_MAX_HEADER_BYTES must be a valid number".into(),
                        )
                    })?
                    .max(MIN_HEADER_BYTES),
                tunnel_idle_timeout: get_secs("PROXY_TUNNEL_IDLE_TIMEOUT", 60)?,
            },
            pool: PoolConfig {
                list_path: PathBuf::from(get_env_or("ROTATOR_PROXY_LIST", "proxy_list.txt")),
                rotation_interval: get_secs("ROTATOR_ROTATION_INTERVAL", 9)?,
                validate_before_rotate: get_bool("ROTATOR_VALIDATE_BEFORE_ROTATE", true)?,
                validation_timeout: get_secs("ROTATOR_VALIDATION_TIMEOUT", 5)?,
                validation_url: get_url("ROTATOR_VALIDATION_URL", "http://httpbin.org/ip")?,
                validation_concurrency: get_env_or("ROTATOR_VALIDATION_CONCURRENCY", "20")
                    .parse()
                    .map_err(|_| {
                        RotatorError::InvalidConfig(
                            "ROTATOR_VALIDATION_CONCURRENCY must be a valid number".into(),
                        )
                    })?,
            },
            supervisor: SupervisorConfig {
                fetch_interval: get_secs("ROTATOR_FETCH_INTERVAL", 3600)?,
                fetch_command: env::var("ROTATOR_FETCH_COMMAND")
                    .ok()
                    .filter(|cmd| !cmd.trim().is_empty()),
                fetch_timeout: get_secs("ROTATOR_FETCH_TIMEOUT", 120)?,
                health_interval: get_secs("ROTATOR_HEALTH_INTERVAL", 60)?,
                health_initial_delay: get_secs("ROTATOR_HEALTH_INITIAL_DELAY", 10)?,
                health_timeout: get_secs("ROTATOR_HEALTH_TIMEOUT", 10)?,
                health_url: get_url("ROTATOR_HEALTH_URL", "http://httpbin.org/ip")?.ok_or_else(
                    || RotatorError::InvalidConfig("ROTATOR_HEALTH_URL must not be empty".into()),
                )?,
                failure_threshold: get_env_or("ROTATOR_FAILURE_THRESHOLD", "3")
                    .parse()
                    .map_err(|_| {
                        RotatorError::InvalidConfig(
                            "ROTATOR_FAILURE_THRESHOLD must be a valid number".into(),
                        )
                    })?,
                max_restarts: get_env_or("ROTATOR_MAX_RESTARTS", "10").parse().map_err(|_| {
                    RotatorError::InvalidConfig("ROTATOR_MAX_RESTARTS must be a valid number".into())
                })?,
                restart_drain: get_secs("ROTATOR_RESTART_DRAIN", 10)?,
                shutdown_grace: get_secs("ROTATOR_SHUTDOWN_GRACE", 10)?,
                cleanup_on_exit: get_bool("ROTATOR_CLEANUP_ON_EXIT", false)?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("rotation interval", self.pool.rotation_interval),
            ("fetch interval", self.supervisor.fetch_interval),
            ("health interval", self.supervisor.health_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(RotatorError::InvalidConfig(format!("{} must be positive", name)));
            }
        }

        if self.supervisor.failure_threshold == 0 {
            return Err(RotatorError::InvalidConfig(
                "failure threshold must be at least 1".into(),
            ));
        }

        if self.supervisor.health_url.scheme() != "http" {
            return Err(RotatorError::InvalidConfig(
                "health URL must use plain http".into(),
            ));
        }

        if let Some(url) = &self.pool.validation_url {
            if url.scheme() != "http" {
                return Err(RotatorError::InvalidConfig(
                    "validation URL must use plain http".into(),
                ));
            }
        }

        Ok(())
    }

    /// Get the forwarding server address
    pub fn proxy_addr(&self) -> String {
        if self.proxy.host.contains(':') {
            format!("[{}]:{}", self.proxy.host, self.proxy.port)
        } else {
            format!("{}:{}", self.proxy.host, self.proxy.port)
        }
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Whole seconds from the environment
fn get_secs(key: &str, default: u64) -> Result<Duration> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| RotatorError::InvalidConfig(format!("{} must be a number of seconds", key))),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

fn get_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => parse_bool(&raw)
            .ok_or_else(|| RotatorError::InvalidConfig(format!("{} must be true or false", key))),
        Err(_) => Ok(default),
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Optional URL; an empty value disables it
fn get_url(key: &str, default: &str) -> Result<Option<Url>> {
    let raw = get_env_or(key, default);
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    Url::parse(raw)
        .map(Some)
        .map_err(|e| RotatorError::InvalidConfig(format!("{} must be a valid URL: {}", key, e)))
}
