//! Data Relay Module
//!
//! Joins a local connection to a remote stream and classifies how the
//! copy ended.

pub mod engine;
pub mod stats;

pub use engine::{relay, RelayError, Side};
pub use stats::{ConnectionStats, RelayCounters};
