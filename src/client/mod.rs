//! Client Top Level
//!
//! Local SOCKS5 listener. Each accepted connection is carried as one
//! stream over the supervised tunnel session; the SOCKS5 exchange itself
//! is answered by the server end.

pub mod supervisor;

pub use supervisor::{CertificatePrompt, ReconnectSupervisor, SessionConnector, TlsSessionConnector};

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::Result;

pub struct TunnelClient {
    listener: TcpListener,
    supervisor: Arc<ReconnectSupervisor>,
}

impl TunnelClient {
    pub async fn bind(local_addr: SocketAddr, supervisor: Arc<ReconnectSupervisor>) -> Result<Self> {
        let listener = TcpListener::bind(local_addr)
            .await
            .with_context(|| format!("Failed to bind {}", local_addr))?;
        info!("SOCKS5 listening on {}", listener.local_addr()?);
        Ok(Self { listener, supervisor })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn supervisor(&self) -> Arc<ReconnectSupervisor> {
        self.supervisor.clone()
    }

    /// Accept local connections until `shutdown` fires
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        loop {
            let (tcp, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Failed to accept local connection: {}", e);
                        continue;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Client no longer accepting connections");
                    return Ok(());
                }
            };

            if let Err(e) = tcp.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }

            let supervisor = self.supervisor.clone();
            tokio::spawn(async move {
                match supervisor.relay(tcp).await {
                    Ok(()) => {}
                    Err(e) if e.is_permanent() => error!("Connection from {} refused: {}", peer, e),
                    Err(e) => warn!("Connection from {} failed: {}", peer, e),
                }
            });
        }
    }
}
