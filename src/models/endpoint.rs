use std::sync::atomic::{AtomicBool, Ordering};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Protocol spoken by an upstream endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Http,
    Socks5,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            // Both speak plain HTTP proxy semantics to the endpoint itself.
            "http" | "https" => Some(ProxyScheme::Http),
            "socks5" | "socks5h" => Some(ProxyScheme::Socks5),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An upstream proxy endpoint
///
/// Identity (scheme, host, port, credentials) never changes after construction.
/// Only the validation state moves, and a reload replaces the whole value.
#[derive(Debug)]
pub struct ProxyEndpoint {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    valid: AtomicBool,
    last_validated_at: RwLock<Option<DateTime<Utc>>>,
}

impl ProxyEndpoint {
    pub fn new(scheme: ProxyScheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
            username: None,
            password: None,
            valid: AtomicBool::new(true),
            last_validated_at: RwLock::new(None),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Deduplication key; two entries with the same key are the same endpoint
    pub fn key(&self) -> String {
        match &self.username {
            Some(user) => format!("{}://{}@{}", self.scheme, user, self.address()),
            None => format!("{}://{}", self.scheme, self.address()),
        }
    }

    /// `Proxy-Authorization` header value, when credentials are present
    pub fn basic_auth(&self) -> Option<String> {
        let username = self.username.as_ref()?;
        let password = self.password.as_deref().unwrap_or("");
        let credentials = format!("{}:{}", username, password);
        Some(format!("Basic {}", BASE64.encode(credentials.as_bytes())))
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn mark_valid(&self) {
        self.valid.store(true, Ordering::Release);
        *self.last_validated_at.write() = Some(Utc::now());
    }

    pub fn mark_invalid(&self) {
        self.valid.store(false, Ordering::Release);
        *self.last_validated_at.write() = Some(Utc::now());
    }

    pub fn last_validated_at(&self) -> Option<DateTime<Utc>> {
        *self.last_validated_at.read()
    }
}

/// Credentials are never printed.
impl std::fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.address())
    }
}
