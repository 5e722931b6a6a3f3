//! Rotator - rotating forward proxy
//!
//! A local HTTP/HTTPS forwarding proxy that relays traffic through a rotating
//! pool of upstream proxies, kept alive by a supervisor.
//!
//! ## Features
//!
//! - HTTP relay and CONNECT tunneling through HTTP or SOCKS5 upstreams
//! - Timed rotation with optional validation of the next endpoint
//! - Hot reload of the endpoint list from a file or an external fetch command
//! - Loopback health probing with a bounded restart policy
//! - Graceful shutdown with session draining

pub mod cli;
pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod proxy;
pub mod services;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{Result, RotatorError};
pub use pool::{EndpointPool, LoadError};
pub use supervisor::Supervisor;
