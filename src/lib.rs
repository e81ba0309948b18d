//! MuxTunnel
//!
//! TLS tunnel with a SOCKS5 front end. The client accepts local SOCKS5
//! connections and carries each one as a stream over a single
//! authenticated, multiplexed TLS session; the server answers the SOCKS5
//! exchange, applies destination policy and dials out.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod mux;
pub mod policy;
pub mod protocol;
pub mod relay;
pub mod security;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod tls;

pub use client::TunnelClient;
pub use config::Config;
pub use error::TunnelError;
pub use server::TunnelServer;
pub use shutdown::ShutdownCoordinator;

/// Result type for application-level code
pub type Result<T> = anyhow::Result<T>;
