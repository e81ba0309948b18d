//! Client Session

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::auth::{AuthRequest, AuthResult, RpcConn, AUTH_METHOD};
use crate::config::MuxConfig;
use crate::error::TunnelError;
use crate::mux::{Multiplexer, MuxStream};
use crate::relay;

/// Client side of one authenticated transport
pub struct ClientSession {
    id: String,
    mux: Multiplexer,
}

impl ClientSession {
    /// Open the control stream over a fresh transport and authenticate.
    ///
    /// A rejection is reported as [`TunnelError::AuthFailed`], which callers
    /// must not retry.
    pub async fn establish<T>(
        io: T,
        mux_config: MuxConfig,
        user: &str,
        password: &str,
    ) -> Result<Self, TunnelError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mux = Multiplexer::client(io, mux_config);
        let control = mux.open_stream().await?;

        let mut rpc = RpcConn::new(control);
        let request = AuthRequest {
            user: user.to_string(),
            password: password.to_string(),
        };
        let result: AuthResult = rpc.call(AUTH_METHOD, &request).await?;
        if !result.ok {
            mux.close();
            return Err(TunnelError::AuthFailed);
        }

        info!("[{}] Session established", result.id);
        Ok(Self { id: result.id, mux })
    }

    /// Identifier assigned by the server
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn open_stream(&self) -> Result<MuxStream, TunnelError> {
        self.mux.open_stream().await
    }

    /// Relay one local connection through a new data stream.
    ///
    /// Benign terminations count as success. A failure while the transport is
    /// still up belongs to this stream alone and comes back as
    /// [`TunnelError::Io`]; once the transport is gone the close reason is
    /// returned instead.
    pub async fn relay<L>(&self, local: L) -> Result<(), TunnelError>
    where
        L: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = self.open_stream().await?;
        let stream_id = stream.id();

        match relay::relay(local, stream).await {
            Ok(stats) => {
                debug!(
                    "[{}] Stream {} done: {} bytes up, {} bytes down",
                    self.id, stream_id, stats.bytes_up, stats.bytes_down
                );
                Ok(())
            }
            Err(e) if e.is_benign() => {
                debug!("[{}] Stream {} ended: {}", self.id, stream_id, e);
                Ok(())
            }
            Err(_) if self.mux.is_closed() => Err(self.mux.close_error()),
            Err(e) => Err(TunnelError::Io(e.source)),
        }
    }

    pub fn close(&self) {
        self.mux.close();
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
