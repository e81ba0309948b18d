//! Authentication Module
//!
//! Credential checking, the control-stream RPC that carries it, and the
//! session identifiers issued on success.

pub mod authenticator;
pub mod id;
pub mod rpc;

pub use authenticator::Authenticator;
pub use id::unique_id;
pub use rpc::{AuthRequest, AuthResult, RpcConn, AUTH_METHOD};
