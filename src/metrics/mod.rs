//! Metrics Module
//!
//! Prometheus counters and their HTTP exporter.

pub mod collector;
pub mod server;

pub use collector::Metrics;
pub use server::MetricsServer;
