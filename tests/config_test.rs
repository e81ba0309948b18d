//! Configuration file loading and command-line overrides

use anyhow::Result;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

use muxtunnel::config::ConfigManager;

#[test]
fn test_load_full_config_file() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("muxtunnel.toml");
    fs::write(
        &config_path,
        r#"
[server]
bind_addr = "127.0.0.1:7000"
external_dns = "9.9.9.9:53"
dial_timeout = "5s"

[client]
server_addr = "tunnel.example.com"
local_addr = "127.0.0.1:1081"
user = "alice"
password = "secret"
reconnect_interval = "2s"

[auth]
enabled = true

[[auth.users]]
username = "alice"
password = "secret"

[rate_limit]
burst = 10
refill_interval = "10s"

[logging]
level = "debug"
dedup_window = "1m"
"#,
    )?;

    let config = ConfigManager::load_from_file(&config_path)?;
    assert_eq!(config.server.bind_addr, "127.0.0.1:7000");
    assert_eq!(config.server.external_dns, Some("9.9.9.9:53".parse::<std::net::SocketAddr>()?));
    assert_eq!(config.server.dial_timeout, Duration::from_secs(5));
    assert_eq!(config.client.local_addr.port(), 1081);
    assert_eq!(config.client.reconnect_interval, Duration::from_secs(2));
    assert_eq!(config.auth.users.len(), 1);
    assert_eq!(config.rate_limit.burst, 10);
    assert_eq!(config.logging.dedup_window, Duration::from_secs(60));
    // untouched sections keep their defaults
    assert_eq!(config.mux.max_stream_window, 256 * 1024);
    Ok(())
}

#[test]
fn test_invalid_config_is_rejected() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("muxtunnel.toml");
    fs::write(&config_path, "[auth]\nenabled = true\n")?;

    let err = ConfigManager::load_from_file(&config_path).unwrap_err();
    assert!(format!("{:#}", err).contains("at least one user"));
    Ok(())
}

#[test]
fn test_cli_overrides_take_priority() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("muxtunnel.toml");
    fs::write(&config_path, "[server]\nbind_addr = \":9000\"\n")?;

    let mut config = ConfigManager::load_from_file(&config_path)?;
    config.merge_server_cli_args(
        Some("127.0.0.1:9100"),
        Some(Path::new("/etc/muxtunnel/server.pem")),
        None,
        Some("alice"),
        Some("secret"),
        None,
        Some("127.0.0.1:9200".parse()?),
    );
    assert_eq!(config.server.bind_addr, "127.0.0.1:9100");
    assert!(config.auth.enabled);
    assert!(config.metrics.enabled);
    assert!(config.validate().is_ok());

    config.merge_client_cli_args(Some("tunnel.example.com"), Some(1090), None, None, true, None);
    assert_eq!(config.client.server_addr, "tunnel.example.com");
    assert_eq!(config.client.local_addr.port(), 1090);
    assert!(config.client.skip_cert_verify);
    Ok(())
}
