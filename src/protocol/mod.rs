//! SOCKS5 Protocol Implementation
//!
//! The request-handling engine run on every data stream, plus the client
//! side of the same exchange.

pub mod constants;
pub mod handler;
pub mod types;

pub use constants::*;
pub use handler::{dial_error_reply, Socks5Handler};
pub use types::*;
