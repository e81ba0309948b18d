//! MuxTunnel - SOCKS5 over multiplexed TLS

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::{BufRead, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use muxtunnel::{
    client::{ReconnectSupervisor, TlsSessionConnector},
    config::ConfigManager,
    metrics::{Metrics, MetricsServer},
    Config, ShutdownCoordinator, TunnelClient, TunnelServer,
};

#[derive(Parser, Debug)]
#[command(name = "muxtunnel")]
#[command(about = "SOCKS5 proxy tunneled over multiplexed TLS")]
#[command(version)]
#[command(long_about = "
SOCKS5 proxy tunneled over multiplexed TLS.

Run `muxtunnel server` on the remote host and `muxtunnel client` locally;
point applications at the client's SOCKS5 port.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = "muxtunnel.toml")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept tunnel sessions and dial destinations
    Server(ServerArgs),
    /// Serve SOCKS5 locally and forward through the tunnel
    Client(ClientArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Listen address; port 9820 when omitted
    #[arg(long)]
    pub addr: Option<String>,

    /// PEM certificate chain; a self-signed certificate is generated when unset
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// PEM private key; read from the certificate file when unset
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Required user name
    #[arg(long)]
    pub user: Option<String>,

    /// Required password
    #[arg(long = "pw")]
    pub password: Option<String>,

    /// Upstream DNS server (e.g. 1.1.1.1:53)
    #[arg(long)]
    pub external_dns: Option<SocketAddr>,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server address; port 9820 when omitted
    #[arg(long)]
    pub addr: Option<String>,

    /// Local SOCKS5 port
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub user: Option<String>,

    #[arg(long = "pw")]
    pub password: Option<String>,

    /// Accept any server certificate
    #[arg(long)]
    pub skip_tls_verify: bool,

    /// Extra trusted CA certificates in PEM format
    #[arg(long)]
    pub ca_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    init_tracing(&args, &config)?;
    info!("Starting MuxTunnel v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Server(server_args) => {
            config.merge_server_cli_args(
                server_args.addr.as_deref(),
                server_args.cert.as_deref(),
                server_args.key.as_deref(),
                server_args.user.as_deref(),
                server_args.password.as_deref(),
                server_args.external_dns,
                server_args.metrics_addr,
            );
            config
                .validate()
                .context("Final configuration validation failed")?;
            run_server(config).await
        }
        Command::Client(client_args) => {
            config.merge_client_cli_args(
                client_args.addr.as_deref(),
                client_args.port,
                client_args.user.as_deref(),
                client_args.password.as_deref(),
                client_args.skip_tls_verify,
                client_args.ca_file.as_deref(),
            );
            config
                .validate()
                .context("Final configuration validation failed")?;
            if config.client.server_addr.trim().is_empty() {
                anyhow::bail!("client needs a server address (--addr or client.server_addr)");
            }
            run_client(config).await
        }
    }
}

async fn run_server(config: Config) -> Result<()> {
    let shutdown = ShutdownCoordinator::new(config.server.shutdown_timeout);

    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        let exporter = MetricsServer::bind(metrics.clone(), &config.metrics.bind_addr.to_string()).await?;
        info!("Metrics available at http://{}/metrics", exporter.local_addr()?);
        tokio::spawn(exporter.run());
        Some(metrics)
    } else {
        None
    };

    let server = TunnelServer::bind(&config, metrics).await?;
    let active = server.active_sessions();
    let server_handle = tokio::spawn(server.run(shutdown.subscribe()));

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shut down gracefully");
    if let Err(e) = shutdown.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
        shutdown.trigger();
    }

    match server_handle.await {
        Ok(Err(e)) => error!("Server error: {:#}", e),
        Err(e) if !e.is_cancelled() => error!("Server task failed: {}", e),
        _ => {}
    }

    shutdown.drain(|| active.load(Ordering::SeqCst)).await;
    info!("Server shutdown complete");
    Ok(())
}

async fn run_client(config: Config) -> Result<()> {
    let connector = TlsSessionConnector::from_config(&config.client, config.mux.clone())
        .with_prompt(Arc::new(ask_continue_unverified));
    let supervisor = Arc::new(ReconnectSupervisor::new(
        Arc::new(connector),
        config.client.reconnect_interval,
    ));

    supervisor
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", config.client.server_addr))?;

    let client = TunnelClient::bind(config.client.local_addr, supervisor).await?;
    let shutdown = ShutdownCoordinator::new(config.server.shutdown_timeout);
    let client_handle = tokio::spawn(client.run(shutdown.subscribe()));

    if let Err(e) = shutdown.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
        shutdown.trigger();
    }

    match client_handle.await {
        Ok(Err(e)) => error!("Client error: {:#}", e),
        Err(e) if !e.is_cancelled() => error!("Client task failed: {}", e),
        _ => {}
    }

    info!("Client shutdown complete");
    Ok(())
}

/// Terminal prompt for a server certificate from an unknown authority
fn ask_continue_unverified(server: &str) -> bool {
    let mut stderr = std::io::stderr();
    let _ = write!(
        stderr,
        "The certificate of {} is signed by an unknown authority.\nContinue without verification? [y/N] ",
        server
    );
    let _ = stderr.flush();

    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, config: &Config) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        args.log_level.as_deref().unwrap_or(&config.logging.level)
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
