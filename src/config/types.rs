//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::security::RateLimitConfig;

/// Port used when a server address omits one
pub const DEFAULT_SERVER_PORT: u16 = 9820;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub auth: AuthConfig,
    pub tls: TlsConfig,
    pub rate_limit: RateLimitConfig,
    pub mux: MuxConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Server side configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address; the default port is appended when omitted
    pub bind_addr: String,
    /// Upstream DNS server used for hostname resolution. System resolver when unset.
    pub external_dns: Option<SocketAddr>,
    #[serde(with = "humantime_serde")]
    pub dns_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
    /// Delay before a session with rejected credentials is torn down
    #[serde(with = "humantime_serde")]
    pub auth_failure_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Client side configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address; the default port is appended when omitted
    pub server_addr: String,
    /// Name checked against the server certificate. Host part of `server_addr` when unset.
    pub server_name: Option<String>,
    /// Local SOCKS5 listen address
    pub local_addr: SocketAddr,
    pub user: String,
    pub password: String,
    pub skip_cert_verify: bool,
    /// Extra trust anchors in PEM format
    pub ca_file: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub users: Vec<UserConfig>,
}

/// User configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
}

/// Server certificate configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain. A self-signed certificate is generated when unset.
    pub cert_file: Option<PathBuf>,
    /// PEM private key. Read from `cert_file` when unset.
    pub key_file: Option<PathBuf>,
    /// Reload the certificate when the files change
    pub watch: bool,
    pub common_name: String,
    pub organization: String,
}

/// Multiplexer tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MuxConfig {
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub keepalive_timeout: Duration,
    /// Bytes a peer may send on one stream before waiting for credit
    pub max_stream_window: u32,
    /// Per-stream buffer between the transport and the stream reader
    pub stream_buffer: usize,
    /// Peer-opened streams queued before accept
    pub accept_backlog: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// How long an identical policy or DNS log line stays suppressed
    #[serde(with = "humantime_serde")]
    pub dedup_window: Duration,
}

/// Prometheus exporter configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", DEFAULT_SERVER_PORT),
            external_dns: None,
            dns_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(30),
            auth_failure_grace: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            server_name: None,
            local_addr: SocketAddr::from(([127, 0, 0, 1], 1080)),
            user: String::new(),
            password: String::new(),
            skip_cert_verify: false,
            ca_file: None,
            connect_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(1),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_file: None,
            key_file: None,
            watch: true,
            common_name: "muxtunnel".to_string(),
            organization: "MuxTunnel".to_string(),
        }
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(30),
            max_stream_window: 256 * 1024,
            stream_buffer: 64 * 1024,
            accept_backlog: 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dedup_window: Duration::from_secs(300),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9821)),
        }
    }
}
