//! Control-stream authentication over in-memory transports

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use muxtunnel::auth::Authenticator;
use muxtunnel::config::{MuxConfig, ServerConfig};
use muxtunnel::mux::Multiplexer;
use muxtunnel::policy::AllowAll;
use muxtunnel::session::{ClientSession, ServerContext, ServerSession, SessionState};
use muxtunnel::TunnelError;

fn peer() -> SocketAddr {
    "192.0.2.10:40000".parse().unwrap()
}

fn context(grace: Duration) -> Arc<ServerContext> {
    let server = ServerConfig {
        auth_failure_grace: grace,
        handshake_timeout: Duration::from_secs(5),
        ..ServerConfig::default()
    };
    Arc::new(ServerContext::new(
        &server,
        MuxConfig::default(),
        Authenticator::single("alice", "secret"),
        Arc::new(AllowAll::default()),
    ))
}

async fn wait_for_state(session: &ServerSession, state: SessionState, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if session.state() == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    session.state() == state
}

#[tokio::test]
async fn test_valid_credentials_open_session() -> Result<()> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = ServerSession::new(server_io, peer(), context(Duration::from_millis(100)));
    tokio::spawn(server.clone().run());

    let client = timeout(
        Duration::from_secs(5),
        ClientSession::establish(client_io, MuxConfig::default(), "alice", "secret"),
    )
    .await??;

    assert!(server.is_authenticated());
    assert_eq!(server.state(), SessionState::Active);
    assert_eq!(server.id().as_deref(), Some(client.id()));
    assert!(!client.id().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_wrong_password_is_rejected_and_closed() -> Result<()> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = ServerSession::new(server_io, peer(), context(Duration::from_millis(100)));
    tokio::spawn(server.clone().run());

    let result = timeout(
        Duration::from_secs(5),
        ClientSession::establish(client_io, MuxConfig::default(), "alice", "wrong"),
    )
    .await?;

    assert!(matches!(result, Err(TunnelError::AuthFailed)));
    assert!(!server.is_authenticated());
    assert!(server.id().is_none());
    assert!(wait_for_state(&server, SessionState::Closed, Duration::from_secs(2)).await);
    Ok(())
}

#[tokio::test]
async fn test_data_stream_before_auth_closes_session() -> Result<()> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = ServerSession::new(server_io, peer(), context(Duration::from_millis(100)));
    tokio::spawn(server.clone().run());

    let mux = Multiplexer::client(client_io, MuxConfig::default());
    let _control = mux.open_stream().await?;
    let _data = mux.open_stream().await?;

    assert!(wait_for_state(&server, SessionState::Closed, Duration::from_secs(2)).await);
    assert!(!server.is_authenticated());
    Ok(())
}

#[tokio::test]
async fn test_missing_control_stream_times_out() -> Result<()> {
    let server_config = ServerConfig {
        handshake_timeout: Duration::from_millis(100),
        ..ServerConfig::default()
    };
    let ctx = Arc::new(ServerContext::new(
        &server_config,
        MuxConfig::default(),
        Authenticator::single("alice", "secret"),
        Arc::new(AllowAll::default()),
    ));

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let _mux = Multiplexer::client(client_io, MuxConfig::default());
    let server = ServerSession::new(server_io, peer(), ctx);
    tokio::spawn(server.clone().run());

    assert!(wait_for_state(&server, SessionState::Closed, Duration::from_secs(2)).await);
    Ok(())
}
