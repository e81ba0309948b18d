//! Tunnel Sessions
//!
//! A session owns one multiplexed transport, its authentication state and
//! its identifier. Server sessions are created per inbound connection,
//! client sessions per outbound connection attempt.

pub mod client;
pub mod server;

pub use client::ClientSession;
pub use server::{ServerContext, ServerSession};

/// Lifecycle of a server session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Active,
    Closed,
}
