//! Reconnect Supervisor
//!
//! Keeps one authenticated [`ClientSession`] available to relays. After a
//! transport failure exactly one task replaces the session, retrying on a
//! fixed interval, while new relays wait for it to finish.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::{host_of, with_default_port, ClientConfig, MuxConfig};
use crate::error::TunnelError;
use crate::metrics::Metrics;
use crate::session::ClientSession;
use crate::tls;

/// Produces a freshly authenticated session
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self) -> Result<ClientSession, TunnelError>;
}

/// Asked whether to continue when the server certificate is signed by an
/// unknown authority. Receives the server address. Runs on a blocking thread.
pub type CertificatePrompt = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Dials the server over TLS and authenticates
pub struct TlsSessionConnector {
    server_addr: String,
    server_name: String,
    ca_file: Option<PathBuf>,
    skip_verify: AtomicBool,
    prompt: Option<CertificatePrompt>,
    prompt_declined: AtomicBool,
    user: String,
    password: String,
    mux: MuxConfig,
    connect_timeout: Duration,
}

impl TlsSessionConnector {
    pub fn from_config(config: &ClientConfig, mux: MuxConfig) -> Self {
        let server_addr = with_default_port(&config.server_addr);
        let server_name = config
            .server_name
            .clone()
            .unwrap_or_else(|| host_of(&server_addr).to_string());
        Self {
            server_addr,
            server_name,
            ca_file: config.ca_file.clone(),
            skip_verify: AtomicBool::new(config.skip_cert_verify),
            prompt: None,
            prompt_declined: AtomicBool::new(false),
            user: config.user.clone(),
            password: config.password.clone(),
            mux,
            connect_timeout: config.connect_timeout,
        }
    }

    pub fn with_prompt(mut self, prompt: CertificatePrompt) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn skips_verification(&self) -> bool {
        self.skip_verify.load(Ordering::Acquire)
    }

    async fn try_connect(&self) -> Result<ClientSession, TunnelError> {
        let config = tls::client_config(self.skips_verification(), self.ca_file.as_deref())?;
        let dial = tls::connect(Arc::new(config), &self.server_addr, &self.server_name);
        let stream = tokio::time::timeout(self.connect_timeout, dial)
            .await
            .map_err(|_| TunnelError::Timeout)??;
        ClientSession::establish(stream, self.mux.clone(), &self.user, &self.password).await
    }

    /// Ask once whether to trust an unknown issuer from now on
    async fn confirm_untrusted(&self) -> bool {
        let prompt = match &self.prompt {
            Some(prompt) if !self.prompt_declined.load(Ordering::Acquire) => prompt.clone(),
            _ => return false,
        };
        let addr = self.server_addr.clone();
        let accepted = tokio::task::spawn_blocking(move || prompt(&addr))
            .await
            .unwrap_or(false);
        if !accepted {
            self.prompt_declined.store(true, Ordering::Release);
        }
        accepted
    }
}

#[async_trait]
impl SessionConnector for TlsSessionConnector {
    async fn connect(&self) -> Result<ClientSession, TunnelError> {
        match self.try_connect().await {
            Err(TunnelError::Io(e)) if tls::is_unknown_issuer(&e) && !self.skips_verification() => {
                if !self.confirm_untrusted().await {
                    return Err(TunnelError::Io(e));
                }
                warn!(
                    "Certificate verification disabled for {} at user request",
                    self.server_addr
                );
                self.skip_verify.store(true, Ordering::Release);
                self.try_connect().await
            }
            other => other,
        }
    }
}

pub struct ReconnectSupervisor {
    connector: Arc<dyn SessionConnector>,
    session: RwLock<Option<Arc<ClientSession>>>,
    reconnecting: AtomicBool,
    auth_rejected: AtomicBool,
    retry_interval: Duration,
    retry_loops: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl ReconnectSupervisor {
    pub fn new(connector: Arc<dyn SessionConnector>, retry_interval: Duration) -> Self {
        Self {
            connector,
            session: RwLock::new(None),
            reconnecting: AtomicBool::new(false),
            auth_rejected: AtomicBool::new(false),
            retry_interval,
            retry_loops: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Establish the first session. Failure here is returned, not retried.
    pub async fn connect(&self) -> Result<(), TunnelError> {
        let session = self.connector.connect().await?;
        *self.session.write().await = Some(Arc::new(session));
        Ok(())
    }

    pub async fn session(&self) -> Option<Arc<ClientSession>> {
        self.session.read().await.clone()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    /// Reconnect loops started so far
    pub fn retry_loops(&self) -> u64 {
        self.retry_loops.load(Ordering::Relaxed)
    }

    /// Start a reconnect loop unless one is already running.
    /// Returns whether this call started it.
    pub fn trigger_reconnect(self: &Arc<Self>) -> bool {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.retry_loops.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.reconnects_total.inc();
        }
        tokio::spawn(self.clone().reconnect_loop());
        true
    }

    /// Relay one local connection through the current session.
    ///
    /// Waits while a reconnect is running. Only a dead transport hands the
    /// session to the reconnect loop; stream-level failures are returned to
    /// the caller and leave the session in place.
    pub async fn relay<L>(self: &Arc<Self>, local: L) -> Result<(), TunnelError>
    where
        L: AsyncRead + AsyncWrite + Unpin,
    {
        while self.is_reconnecting() {
            tokio::time::sleep(self.retry_interval).await;
        }

        let session = match self.session().await {
            Some(session) => session,
            None if self.auth_rejected.load(Ordering::Acquire) => return Err(TunnelError::AuthFailed),
            None => {
                self.trigger_reconnect();
                return Err(TunnelError::TransportClosed);
            }
        };

        let result = session.relay(local).await;
        if let Err(e) = &result {
            if let Some(metrics) = &self.metrics {
                metrics.relay_errors_total.inc();
            }
            if !e.is_transport_failure() {
                debug!("[{}] Stream failed: {}", session.id(), e);
            } else if self.is_current(&session).await && self.trigger_reconnect() {
                // a failure from an already replaced session says nothing
                // about the current one
                warn!("[{}] Transport failed: {}; reconnecting", session.id(), e);
            }
        }
        result
    }

    async fn is_current(&self, session: &Arc<ClientSession>) -> bool {
        self.session
            .read()
            .await
            .as_ref()
            .map(|current| Arc::ptr_eq(current, session))
            .unwrap_or(false)
    }

    async fn reconnect_loop(self: Arc<Self>) {
        if let Some(stale) = self.session.write().await.take() {
            stale.close();
        }

        loop {
            tokio::time::sleep(self.retry_interval).await;
            match self.connector.connect().await {
                Ok(session) => {
                    info!("[{}] Reconnected", session.id());
                    *self.session.write().await = Some(Arc::new(session));
                    break;
                }
                Err(e) if e.is_permanent() => {
                    error!("Reconnect rejected: {}; giving up", e);
                    self.auth_rejected.store(true, Ordering::Release);
                    break;
                }
                Err(e) => warn!("Reconnect failed: {}; retrying in {:?}", e, self.retry_interval),
            }
        }

        self.reconnecting.store(false, Ordering::Release);
    }
}
