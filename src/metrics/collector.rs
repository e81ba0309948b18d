//! Metrics Collector

use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};
use tracing::error;

/// Prometheus counters for both tunnel roles
pub struct Metrics {
    registry: Registry,
    pub sessions_total: IntCounter,
    pub active_sessions: IntGauge,
    pub auth_failures_total: IntCounter,
    pub rate_limited_total: IntCounter,
    pub streams_total: IntCounter,
    pub relay_errors_total: IntCounter,
    pub reconnects_total: IntCounter,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let sessions_total = IntCounter::new(
            "muxtunnel_sessions_total",
            "Total number of tunnel sessions accepted",
        )?;
        let active_sessions = IntGauge::new(
            "muxtunnel_active_sessions",
            "Number of currently open tunnel sessions",
        )?;
        let auth_failures_total = IntCounter::new(
            "muxtunnel_auth_failures_total",
            "Total rejected authentication attempts",
        )?;
        let rate_limited_total = IntCounter::new(
            "muxtunnel_rate_limited_total",
            "Total connections rejected by the rate limiter",
        )?;
        let streams_total = IntCounter::new(
            "muxtunnel_streams_total",
            "Total data streams served or opened",
        )?;
        let relay_errors_total = IntCounter::new(
            "muxtunnel_relay_errors_total",
            "Total relays that ended with a non-benign error",
        )?;
        let reconnects_total = IntCounter::new(
            "muxtunnel_reconnects_total",
            "Total reconnect loops started by the client",
        )?;

        registry.register(Box::new(sessions_total.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(auth_failures_total.clone()))?;
        registry.register(Box::new(rate_limited_total.clone()))?;
        registry.register(Box::new(streams_total.clone()))?;
        registry.register(Box::new(relay_errors_total.clone()))?;
        registry.register(Box::new(reconnects_total.clone()))?;

        Ok(Self {
            registry,
            sessions_total,
            active_sessions,
            auth_failures_total,
            rate_limited_total,
            streams_total,
            relay_errors_total,
            reconnects_total,
        })
    }

    /// Render all metrics in the Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        match encoder.encode_to_string(&self.registry.gather()) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                String::new()
            }
        }
    }
}
