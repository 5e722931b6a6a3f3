//! Forwarding server implementation
//!
//! This module provides the forwarding functionality including:
//! - HTTP relay through the bound upstream endpoint
//! - Bounded, timed reading of the first request head
//! - CONNECT tunnels with idle and forced termination
//! - Upstream transports for HTTP and SOCKS5 endpoints
//! - A restartable server handle with graceful drain

pub mod handler;
mod head;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use handler::{ProxyBody, ProxyHandler, ProxyHandlerConfig};
pub use server::{probe_through, ForwardingServer, ServerControl, ServerHandle};
pub use transport::ProxyTransport;
pub use tunnel::{SessionGuard, SessionTracker, TunnelEnd, TunnelHandler, TunnelStats};
