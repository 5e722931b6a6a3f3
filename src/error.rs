use hyper::StatusCode;
use thiserror::Error;

use crate::pool::LoadError;

/// Unified error type for the rotator
#[derive(Error, Debug)]
pub enum RotatorError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Proxy list errors
    #[error("Proxy list unusable: {0}")]
    Load(#[from] LoadError),

    #[error("All upstream endpoints are invalid")]
    PoolDegraded,

    // Upstream errors
    #[error("Upstream connection failed: {0}")]
    UpstreamConnectFailed(String),

    #[error("Upstream timed out")]
    UpstreamTimeout,

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    // Client protocol errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Lifecycle errors
    #[error("Cannot bind {addr}: {source}")]
    AddressInUse {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Forwarding server unresponsive: {0}")]
    Process(String),

    #[error("Forwarding server restarted {restarts} times without recovering, giving up")]
    RestartCapExceeded { restarts: u32 },

    #[error("Fetch failed: {0}")]
    Fetch(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for rotator operations
pub type Result<T> = std::result::Result<T, RotatorError>;

impl RotatorError {
    /// HTTP status reported to a local client when this error ends its request
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            RotatorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            // 502 Bad Gateway
            RotatorError::UpstreamConnectFailed(_)
            | RotatorError::PoolDegraded
            | RotatorError::InvalidProxyAddress(_)
            | RotatorError::Http(_) => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            RotatorError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            RotatorError::InvalidConfig(_)
            | RotatorError::Load(_)
            | RotatorError::AddressInUse { .. }
            | RotatorError::Process(_)
            | RotatorError::RestartCapExceeded { .. }
            | RotatorError::Fetch(_)
            | RotatorError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error should terminate the process rather than a single request
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RotatorError::InvalidConfig(_)
                | RotatorError::Load(_)
                | RotatorError::AddressInUse { .. }
                | RotatorError::RestartCapExceeded { .. }
        )
    }

    /// Whether the upstream endpoint that produced this error should be marked invalid
    pub fn blames_upstream(&self) -> bool {
        matches!(
            self,
            RotatorError::UpstreamConnectFailed(_)
                | RotatorError::UpstreamTimeout
                | RotatorError::InvalidProxyAddress(_)
        )
    }
}

// Convert from hyper errors
impl From<hyper::Error> for RotatorError {
    fn from(err: hyper::Error) -> Self {
        RotatorError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for RotatorError {
    fn from(err: url::ParseError) -> Self {
        RotatorError::InvalidConfig(err.to_string())
    }
}
