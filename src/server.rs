//! Server Top Level
//!
//! Accept loop: rate limit by source IP, TLS handshake, then one
//! [`ServerSession`] task per connection.

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::config::{with_default_port, Config};
use crate::metrics::Metrics;
use crate::policy::{DestinationPolicy, RuleSet};
use crate::security::RateLimiter;
use crate::session::{ServerContext, ServerSession};
use crate::tls::{self, CertLoader};
use crate::Result;

pub struct TunnelServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    limiter: Arc<RateLimiter>,
    ctx: Arc<ServerContext>,
    handshake_timeout: Duration,
    active: Arc<AtomicUsize>,
}

impl TunnelServer {
    /// Load the certificate and bind the listener. Both failures are fatal.
    pub async fn bind(config: &Config, metrics: Option<Arc<Metrics>>) -> Result<Self> {
        let rules: Arc<dyn RuleSet> = Arc::new(DestinationPolicy::from_config(config));
        Self::bind_with_rules(config, rules, metrics).await
    }

    /// Like [`TunnelServer::bind`] with caller-supplied destination rules
    pub async fn bind_with_rules(
        config: &Config,
        rules: Arc<dyn RuleSet>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self> {
        let loader = CertLoader::from_config(&config.tls).context("Failed to load server certificate")?;
        let tls_config = tls::server_config(Arc::new(loader))?;

        let addr = with_default_port(&config.server.bind_addr);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        info!("Tunnel server listening on {}", listener.local_addr()?);

        let authenticator = Authenticator::from_config(&config.auth);
        if !authenticator.is_enabled() {
            warn!("Authentication disabled; only empty credentials are accepted");
        }

        let mut ctx = ServerContext::new(&config.server, config.mux.clone(), authenticator, rules);
        if let Some(metrics) = metrics {
            ctx = ctx.with_metrics(metrics);
        }

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            ctx: Arc::new(ctx),
            handshake_timeout: config.server.handshake_timeout,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Counter of sessions currently being served
    pub fn active_sessions(&self) -> Arc<AtomicUsize> {
        self.active.clone()
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        self.limiter.clone()
    }

    /// Accept connections until `shutdown` fires. Per-connection failures
    /// are logged and never stop the loop.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        loop {
            let (tcp, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Server no longer accepting connections");
                    return Ok(());
                }
            };

            if !self.limiter.allow(peer.ip()) {
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.rate_limited_total.inc();
                }
                info!("Rate limit exceeded for {}, connection dropped", peer.ip());
                drop(tcp);
                continue;
            }

            let acceptor = self.acceptor.clone();
            let ctx = self.ctx.clone();
            let active = self.active.clone();
            let handshake_timeout = self.handshake_timeout;
            tokio::spawn(async move {
                active.fetch_add(1, Ordering::SeqCst);
                handle_connection(tcp, peer, acceptor, ctx, handshake_timeout).await;
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }
}

#[tracing::instrument(level = "debug", skip_all, fields(peer = %peer))]
async fn handle_connection(
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    ctx: Arc<ServerContext>,
    handshake_timeout: Duration,
) {
    if let Err(e) = tcp.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }

    let tls = match tokio::time::timeout(handshake_timeout, acceptor.accept(tcp)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            debug!("TLS handshake with {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("TLS handshake with {} timed out", peer);
            return;
        }
    };

    debug!("TLS established with {}", peer);
    ServerSession::new(tls, peer, ctx).run().await;
}
