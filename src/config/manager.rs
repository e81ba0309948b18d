//! Configuration Manager

use super::types::{Config, UserConfig, DEFAULT_SERVER_PORT};
use crate::Result;
use anyhow::{bail, Context};
use std::net::{Ipv6Addr, SocketAddr};
use std::path::Path;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(bind_addr) = std::env::var("MUXTUNNEL_BIND_ADDR") {
            config.server.bind_addr = bind_addr;
        }

        if let Ok(server_addr) = std::env::var("MUXTUNNEL_SERVER_ADDR") {
            config.client.server_addr = server_addr;
        }

        if let Ok(local_addr) = std::env::var("MUXTUNNEL_LOCAL_ADDR") {
            config.client.local_addr = local_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid MUXTUNNEL_LOCAL_ADDR: {}", local_addr))?;
        }

        if let Ok(dns) = std::env::var("MUXTUNNEL_EXTERNAL_DNS") {
            let dns = with_default_port_for(&dns, 53);
            config.server.external_dns = Some(
                dns.parse::<SocketAddr>()
                    .with_context(|| format!("Invalid MUXTUNNEL_EXTERNAL_DNS: {}", dns))?,
            );
        }

        if let Ok(user) = std::env::var("MUXTUNNEL_USER") {
            config.client.user = user;
        }

        if let Ok(password) = std::env::var("MUXTUNNEL_PASSWORD") {
            config.client.password = password;
        }

        if let Ok(cert) = std::env::var("MUXTUNNEL_CERT_FILE") {
            config.tls.cert_file = Some(cert.into());
        }

        if let Ok(key) = std::env::var("MUXTUNNEL_KEY_FILE") {
            config.tls.key_file = Some(key.into());
        }

        if let Ok(skip) = std::env::var("MUXTUNNEL_SKIP_CERT_VERIFY") {
            config.client.skip_cert_verify = skip
                .parse::<bool>()
                .with_context(|| format!("Invalid MUXTUNNEL_SKIP_CERT_VERIFY: {}", skip))?;
        }

        if let Ok(interval) = std::env::var("MUXTUNNEL_RECONNECT_INTERVAL") {
            config.client.reconnect_interval = humantime::parse_duration(&interval)
                .with_context(|| format!("Invalid MUXTUNNEL_RECONNECT_INTERVAL: {}", interval))?;
        }

        if let Ok(log_level) = std::env::var("MUXTUNNEL_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Append the default server port when `addr` has none.
///
/// Accepts `host`, `host:port`, `[v6]`, `[v6]:port`, bare IPv6 and the
/// listen-anywhere form `:port`.
pub fn with_default_port(addr: &str) -> String {
    with_default_port_for(addr, DEFAULT_SERVER_PORT)
}

fn with_default_port_for(addr: &str, default_port: u16) -> String {
    let addr = addr.trim();
    if addr.parse::<SocketAddr>().is_ok() {
        return addr.to_string();
    }
    if let Some(port) = addr.strip_prefix(':') {
        if port.parse::<u16>().is_ok() {
            return format!("0.0.0.0:{}", port);
        }
    }
    if addr.starts_with('[') && addr.ends_with(']') {
        return format!("{}:{}", addr, default_port);
    }
    if addr.parse::<Ipv6Addr>().is_ok() {
        return format!("[{}]:{}", addr, default_port);
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => addr.to_string(),
        _ => format!("{}:{}", addr, default_port),
    }
}

/// Host part of a `host:port` address, without IPv6 brackets
pub fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() && !host.is_empty() => {
            if host.contains(':') && !host.starts_with('[') {
                // bare IPv6 without a port
                addr
            } else {
                host
            }
        }
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_client_config()
            .with_context(|| "Client configuration validation failed")?;

        self.validate_auth_config()
            .with_context(|| "Authentication configuration validation failed")?;

        self.validate_tls_config()
            .with_context(|| "TLS configuration validation failed")?;

        self.validate_limits_config()
            .with_context(|| "Rate limit configuration validation failed")?;

        self.validate_mux_config()
            .with_context(|| "Multiplexer configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.bind_addr.trim().is_empty() {
            bail!("server.bind_addr must not be empty");
        }

        if self.server.handshake_timeout.is_zero() {
            bail!("server.handshake_timeout must be greater than 0");
        }

        if self.server.dial_timeout.is_zero() {
            bail!("server.dial_timeout must be greater than 0");
        }

        if self.server.dns_timeout.is_zero() {
            bail!("server.dns_timeout must be greater than 0");
        }

        Ok(())
    }

    fn validate_client_config(&self) -> Result<()> {
        if self.client.reconnect_interval.is_zero() {
            bail!("client.reconnect_interval must be greater than 0");
        }

        if self.client.connect_timeout.is_zero() {
            bail!("client.connect_timeout must be greater than 0");
        }

        if self.client.user.len() > 255 || self.client.password.len() > 255 {
            bail!("client credentials cannot exceed 255 characters");
        }

        Ok(())
    }

    fn validate_auth_config(&self) -> Result<()> {
        if self.auth.enabled && self.auth.users.is_empty() {
            bail!("When authentication is enabled, at least one user must be configured");
        }

        for (i, user) in self.auth.users.iter().enumerate() {
            if user.username.is_empty() {
                bail!("User {} has empty username", i);
            }

            if user.username.len() > 255 {
                bail!("User {} username exceeds 255 characters", i);
            }

            if user.password.len() > 255 {
                bail!("User {} password exceeds 255 characters", i);
            }
        }

        Ok(())
    }

    fn validate_tls_config(&self) -> Result<()> {
        if self.tls.key_file.is_some() && self.tls.cert_file.is_none() {
            bail!("tls.key_file requires tls.cert_file");
        }

        if self.tls.cert_file.is_none() && self.tls.common_name.is_empty() {
            bail!("tls.common_name is required for a generated certificate");
        }

        Ok(())
    }

    fn validate_limits_config(&self) -> Result<()> {
        if !self.rate_limit.enabled {
            return Ok(());
        }

        if self.rate_limit.burst == 0 {
            bail!("rate_limit.burst must be greater than 0");
        }

        if self.rate_limit.refill_interval.is_zero() {
            bail!("rate_limit.refill_interval must be greater than 0");
        }

        Ok(())
    }

    fn validate_mux_config(&self) -> Result<()> {
        if self.mux.keepalive_interval.is_zero() {
            bail!("mux.keepalive_interval must be greater than 0");
        }

        if self.mux.keepalive_timeout <= self.mux.keepalive_interval {
            bail!("mux.keepalive_timeout must exceed mux.keepalive_interval");
        }

        if self.mux.max_stream_window < 1024 {
            bail!("mux.max_stream_window must be at least 1024 bytes");
        }

        if self.mux.stream_buffer < 1024 {
            bail!("mux.stream_buffer must be at least 1024 bytes");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        if self.logging.dedup_window.is_zero() {
            bail!("logging.dedup_window must be greater than 0");
        }

        Ok(())
    }

    /// Merge server command-line overrides
    pub fn merge_server_cli_args(
        &mut self,
        addr: Option<&str>,
        cert: Option<&Path>,
        key: Option<&Path>,
        user: Option<&str>,
        password: Option<&str>,
        external_dns: Option<SocketAddr>,
        metrics_addr: Option<SocketAddr>,
    ) {
        if let Some(addr) = addr {
            self.server.bind_addr = addr.to_string();
            tracing::info!("CLI override: bind address set to {}", addr);
        }

        if let Some(cert) = cert {
            self.tls.cert_file = Some(cert.to_path_buf());
            tracing::info!("CLI override: certificate file set to {}", cert.display());
        }

        if let Some(key) = key {
            self.tls.key_file = Some(key.to_path_buf());
            tracing::info!("CLI override: key file set to {}", key.display());
        }

        if let Some(user) = user.filter(|u| !u.is_empty()) {
            self.auth.enabled = true;
            self.auth.users = vec![UserConfig {
                username: user.to_string(),
                password: password.unwrap_or_default().to_string(),
            }];
            tracing::info!("CLI override: authentication enabled for user {}", user);
        }

        if let Some(dns) = external_dns {
            self.server.external_dns = Some(dns);
            tracing::info!("CLI override: external DNS set to {}", dns);
        }

        if let Some(metrics_addr) = metrics_addr {
            self.metrics.enabled = true;
            self.metrics.bind_addr = metrics_addr;
            tracing::info!("CLI override: metrics exporter on {}", metrics_addr);
        }
    }

    /// Merge client command-line overrides
    pub fn merge_client_cli_args(
        &mut self,
        addr: Option<&str>,
        port: Option<u16>,
        user: Option<&str>,
        password: Option<&str>,
        skip_tls_verify: bool,
        ca_file: Option<&Path>,
    ) {
        if let Some(addr) = addr {
            self.client.server_addr = addr.to_string();
            tracing::info!("CLI override: server address set to {}", addr);
        }

        if let Some(port) = port {
            self.client.local_addr.set_port(port);
            tracing::info!("CLI override: local port set to {}", port);
        }

        if let Some(user) = user {
            self.client.user = user.to_string();
        }

        if let Some(password) = password {
            self.client.password = password.to_string();
        }

        if skip_tls_verify {
            self.client.skip_cert_verify = true;
            tracing::warn!("CLI override: server certificate verification disabled");
        }

        if let Some(ca_file) = ca_file {
            self.client.ca_file = Some(ca_file.to_path_buf());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_with_default_port() {
        assert_eq!(with_default_port("example.com"), "example.com:9820");
        assert_eq!(with_default_port("example.com:443"), "example.com:443");
        assert_eq!(with_default_port("10.0.0.1"), "10.0.0.1:9820");
        assert_eq!(with_default_port("10.0.0.1:1"), "10.0.0.1:1");
        assert_eq!(with_default_port("::1"), "[::1]:9820");
        assert_eq!(with_default_port("[::1]"), "[::1]:9820");
        assert_eq!(with_default_port("[::1]:5000"), "[::1]:5000");
        assert_eq!(with_default_port(":9820"), "0.0.0.0:9820");
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("example.com:9820"), "example.com");
        assert_eq!(host_of("[::1]:9820"), "::1");
        assert_eq!(host_of("10.0.0.1"), "10.0.0.1");
        assert_eq!(host_of("::1"), "::1");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            bind_addr = ":9000"
            external_dns = "1.1.1.1:53"

            [rate_limit]
            burst = 5
            refill_interval = "30s"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind_addr, ":9000");
        assert_eq!(
            config.server.external_dns,
            Some("1.1.1.1:53".parse().unwrap())
        );
        assert_eq!(config.rate_limit.burst, 5);
        assert_eq!(config.rate_limit.refill_interval, Duration::from_secs(30));
        assert_eq!(config.mux.keepalive_interval, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_auth_enabled_without_users_is_invalid() {
        let mut config = Config::default();
        config.auth.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_cli_user_enables_auth() {
        let mut config = Config::default();
        config.merge_server_cli_args(
            Some(":9999"),
            None,
            None,
            Some("alice"),
            Some("secret"),
            None,
            None,
        );
        assert!(config.auth.enabled);
        assert_eq!(config.auth.users.len(), 1);
        assert_eq!(config.auth.users[0].password, "secret");
        assert_eq!(config.server.bind_addr, ":9999");
    }

    #[test]
    fn test_invalid_mux_timeouts() {
        let mut config = Config::default();
        config.mux.keepalive_timeout = config.mux.keepalive_interval;
        assert!(config.validate().is_err());
    }
}
