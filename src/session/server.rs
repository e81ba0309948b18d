//! Server Session
//!
//! One per accepted transport. The first stream the peer opens is the
//! control stream and carries the `Auth` call; every later stream is a
//! data stream served by the SOCKS5 engine, but only once the session is
//! authenticated.

use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::SessionState;
use crate::auth::{unique_id, AuthRequest, AuthResult, Authenticator, RpcConn, AUTH_METHOD};
use crate::config::{MuxConfig, ServerConfig};
use crate::error::TunnelError;
use crate::metrics::Metrics;
use crate::mux::{Multiplexer, MuxStream};
use crate::policy::{RequestContext, RuleSet};
use crate::protocol::Socks5Handler;
use crate::relay::RelayError;

/// Process-wide services shared by every server session
pub struct ServerContext {
    pub authenticator: Authenticator,
    pub rules: Arc<dyn RuleSet>,
    pub mux: MuxConfig,
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
    pub auth_failure_grace: Duration,
    pub metrics: Option<Arc<Metrics>>,
}

impl ServerContext {
    pub fn new(config: &ServerConfig, mux: MuxConfig, authenticator: Authenticator, rules: Arc<dyn RuleSet>) -> Self {
        Self {
            authenticator,
            rules,
            mux,
            handshake_timeout: config.handshake_timeout,
            dial_timeout: config.dial_timeout,
            auth_failure_grace: config.auth_failure_grace,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Server side of one tunnel connection
pub struct ServerSession {
    mux: Multiplexer,
    remote: SocketAddr,
    ctx: Arc<ServerContext>,
    id: RwLock<Option<String>>,
    authenticated: AtomicBool,
    state: Mutex<SessionState>,
    close_logged: AtomicBool,
}

impl ServerSession {
    /// Wrap an established transport. The session starts in `Connecting`.
    pub fn new<T>(io: T, remote: SocketAddr, ctx: Arc<ServerContext>) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mux = Multiplexer::server(io, ctx.mux.clone());
        if let Some(metrics) = &ctx.metrics {
            metrics.sessions_total.inc();
            metrics.active_sessions.inc();
        }
        Arc::new(Self {
            mux,
            remote,
            ctx,
            id: RwLock::new(None),
            authenticated: AtomicBool::new(false),
            state: Mutex::new(SessionState::Connecting),
            close_logged: AtomicBool::new(false),
        })
    }

    /// Session ID, once authenticated
    pub fn id(&self) -> Option<String> {
        self.id.read().clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Log prefix: the session ID once known, the peer address before
    fn tag(&self) -> String {
        self.id().unwrap_or_else(|| self.remote.to_string())
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state != SessionState::Closed {
            *state = next;
        }
    }

    /// Serve the session until its transport closes
    pub async fn run(self: Arc<Self>) {
        self.set_state(SessionState::Authenticating);

        let control = match tokio::time::timeout(self.ctx.handshake_timeout, self.mux.accept_stream()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return self.close(&e.to_string()),
            Err(_) => return self.close("no control stream before handshake timeout"),
        };

        let auth = tokio::spawn(self.clone().authenticate(control));

        loop {
            let stream = match self.mux.accept_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    self.close(&e.to_string());
                    break;
                }
            };

            if !self.is_authenticated() {
                warn!("[{}] client not authenticated", self.tag());
                self.close("data stream before authentication");
                break;
            }

            let session = self.clone();
            tokio::spawn(async move { session.serve_stream(stream).await });
        }

        auth.abort();
    }

    /// Answer the single `Auth` call on the control stream
    async fn authenticate(self: Arc<Self>, control: MuxStream) {
        let outcome = tokio::time::timeout(self.ctx.handshake_timeout, self.exchange(control)).await;
        match outcome {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.auth_failures_total.inc();
                }
                tokio::time::sleep(self.ctx.auth_failure_grace).await;
                self.close("authentication failed");
            }
            Ok(Err(e)) => self.close(&format!("control stream: {}", e)),
            Err(_) => self.close("authentication timed out"),
        }
    }

    async fn exchange(&self, control: MuxStream) -> Result<bool, TunnelError> {
        let mut rpc = RpcConn::new(control);
        let request = rpc.next_request().await?;
        if request.method != AUTH_METHOD {
            let message = format!("unknown method {:?}", request.method);
            rpc.reply::<AuthResult>(&request, Err(message.clone())).await?;
            return Err(TunnelError::protocol(message));
        }

        let auth: AuthRequest = request.body()?;
        if !self.ctx.authenticator.valid(&auth.user, &auth.password) {
            warn!("[{}] Authentication failed for user {:?}", self.tag(), auth.user);
            let result = AuthResult { ok: false, id: String::new() };
            rpc.reply(&request, Ok(&result)).await?;
            return Ok(false);
        }

        let id = unique_id();
        *self.id.write() = Some(id.clone());
        // flag goes up before the reply so the peer's next stream is honored
        self.authenticated.store(true, Ordering::Release);
        self.set_state(SessionState::Active);
        info!("[{}] Session authenticated from {}", id, self.remote);

        let result = AuthResult { ok: true, id };
        rpc.reply(&request, Ok(&result)).await?;
        Ok(true)
    }

    async fn serve_stream(&self, stream: MuxStream) {
        let tag = self.tag();
        let stream_id = stream.id();
        if let Some(metrics) = &self.ctx.metrics {
            metrics.streams_total.inc();
        }

        let ctx = RequestContext::new(tag.clone(), self.remote);
        let result = Socks5Handler::new(stream)
            .serve(&ctx, self.ctx.rules.as_ref(), self.ctx.dial_timeout)
            .await;

        match result {
            Ok(stats) => debug!(
                "[{}] Stream {} done: {} bytes up, {} bytes down in {:?}",
                tag, stream_id, stats.bytes_up, stats.bytes_down, stats.duration
            ),
            Err(e) => match e.downcast_ref::<RelayError>() {
                Some(relay) if !relay.is_benign() => {
                    if let Some(metrics) = &self.ctx.metrics {
                        metrics.relay_errors_total.inc();
                    }
                    warn!("[{}] Stream {} relay error: {}", tag, stream_id, relay);
                }
                _ => debug!("[{}] Stream {} ended: {:#}", tag, stream_id, e),
            },
        }
    }

    /// Close the transport and log the closure exactly once
    pub fn close(&self, reason: &str) {
        self.mux.close();
        *self.state.lock() = SessionState::Closed;
        if self.close_logged.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(metrics) = &self.ctx.metrics {
            metrics.active_sessions.dec();
        }
        info!("[{}] Session closed: {}", self.tag(), reason);
    }
}
