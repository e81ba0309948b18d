//! Configuration Module
//! 
//! Handles configuration loading, validation, and command-line overrides
//! for both the server and the client.

pub mod manager;
pub mod types;

pub use manager::{host_of, with_default_port, ConfigManager};
pub use types::*;
