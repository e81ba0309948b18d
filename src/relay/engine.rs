//! Relay Engine

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ConnectionStats, RelayCounters};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Which end of the relay an error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The accepted connection being proxied
    Local,
    /// The stream or socket leading to the destination
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => write!(f, "local"),
            Side::Remote => write!(f, "remote"),
        }
    }
}

/// An I/O failure attributed to one side of the relay
#[derive(Debug, thiserror::Error)]
#[error("{side} side: {source}")]
pub struct RelayError {
    pub side: Side,
    #[source]
    pub source: io::Error,
}

impl RelayError {
    pub fn new(side: Side, source: io::Error) -> Self {
        Self { side, source }
    }

    /// Expected ways for a relay to end: closed pipes, timeouts on either
    /// side, and anything the local connection did to itself.
    pub fn is_benign(&self) -> bool {
        if self.side == Side::Local {
            return true;
        }
        matches!(
            self.source.kind(),
            io::ErrorKind::BrokenPipe | io::ErrorKind::TimedOut
        )
    }
}

impl From<RelayError> for io::Error {
    fn from(err: RelayError) -> Self {
        err.source
    }
}

/// Copy bytes both ways until both directions finish.
///
/// EOF on one side half-closes the other. An error in either direction
/// stops both. The returned error is the first non-benign one if any.
pub async fn relay<L, R>(local: L, remote: R) -> Result<ConnectionStats, RelayError>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let counters = RelayCounters::new();
    let cancel = CancellationToken::new();

    let (mut local_r, mut local_w) = tokio::io::split(local);
    let (mut remote_r, mut remote_w) = tokio::io::split(remote);

    let (up, down) = tokio::join!(
        pipe(
            &mut local_r,
            &mut remote_w,
            (Side::Local, Side::Remote),
            counters.counter(true),
            &cancel,
        ),
        pipe(
            &mut remote_r,
            &mut local_w,
            (Side::Remote, Side::Local),
            counters.counter(false),
            &cancel,
        ),
    );

    let stats = counters.snapshot();
    match (up, down) {
        (Ok(()), Ok(())) => Ok(stats),
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Err(a), Err(b)) => {
            if a.is_benign() && !b.is_benign() {
                Err(b)
            } else {
                Err(a)
            }
        }
    }
}

async fn pipe<R, W>(
    reader: &mut R,
    writer: &mut W,
    (from, to): (Side, Side),
    counter: &AtomicU64,
    cancel: &CancellationToken,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copy = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| RelayError::new(from, e))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| RelayError::new(to, e))?;
            counter.fetch_add(n as u64, Ordering::Relaxed);
        }
        writer.shutdown().await.map_err(|e| RelayError::new(to, e))?;
        Ok::<(), RelayError>(())
    };

    tokio::select! {
        result = copy => {
            if let Err(e) = &result {
                debug!("Relay {} -> {} stopped: {}", from, to, e);
                cancel.cancel();
            }
            result
        }
        _ = cancel.cancelled() => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relay_round_trip() {
        let (local, mut local_peer) = duplex(1024);
        let (remote, mut remote_peer) = duplex(1024);

        let handle = tokio::spawn(relay(local, remote));

        local_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote_peer.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        local_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(local_peer);
        drop(remote_peer);

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.bytes_up, 4);
        assert_eq!(stats.bytes_down, 5);
        assert_eq!(stats.total_bytes(), 9);
    }

    #[tokio::test]
    async fn test_half_close_propagates() {
        let (local, mut local_peer) = duplex(1024);
        let (remote, mut remote_peer) = duplex(1024);
        let handle = tokio::spawn(relay(local, remote));

        local_peer.write_all(b"request").await.unwrap();
        local_peer.shutdown().await.unwrap();

        let mut received = Vec::new();
        remote_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"request");

        remote_peer.write_all(b"response").await.unwrap();
        drop(remote_peer);

        let mut reply = Vec::new();
        local_peer.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"response");
        assert!(handle.await.unwrap().is_ok());
    }

    #[test]
    fn test_benign_classification() {
        let local = RelayError::new(Side::Local, io::ErrorKind::ConnectionReset.into());
        assert!(local.is_benign());

        let pipe = RelayError::new(Side::Remote, io::ErrorKind::BrokenPipe.into());
        assert!(pipe.is_benign());

        let timeout = RelayError::new(Side::Remote, io::ErrorKind::TimedOut.into());
        assert!(timeout.is_benign());

        let aborted = RelayError::new(Side::Remote, io::ErrorKind::ConnectionAborted.into());
        assert!(!aborted.is_benign());
        assert_eq!(aborted.to_string(), "remote side: connection aborted");
    }
}
