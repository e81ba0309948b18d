//! Multiplexed Stream Handle

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use super::frame::StreamId;

const FAULT_NONE: u8 = 0;
const FAULT_RESET: u8 = 1;
const FAULT_ABORTED: u8 = 2;
const FAULT_TIMED_OUT: u8 = 3;

/// Why a stream ended abnormally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFault {
    /// Peer reset the stream
    Reset,
    /// The transport went away underneath the stream
    Aborted,
    /// The transport stopped answering keepalives
    TimedOut,
}

impl StreamFault {
    fn code(self) -> u8 {
        match self {
            StreamFault::Reset => FAULT_RESET,
            StreamFault::Aborted => FAULT_ABORTED,
            StreamFault::TimedOut => FAULT_TIMED_OUT,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            FAULT_RESET => Some(StreamFault::Reset),
            FAULT_ABORTED => Some(StreamFault::Aborted),
            FAULT_TIMED_OUT => Some(StreamFault::TimedOut),
            _ => None,
        }
    }

    fn to_io_error(self) -> io::Error {
        match self {
            StreamFault::Reset => {
                io::Error::new(io::ErrorKind::ConnectionReset, "stream reset by peer")
            }
            StreamFault::Aborted => io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "multiplexed transport closed",
            ),
            StreamFault::TimedOut => {
                io::Error::new(io::ErrorKind::TimedOut, "multiplexed transport timed out")
            }
        }
    }
}

/// Fault marker shared between a stream handle and its pump task.
/// Set before the pump drops its end, so the handle sees it on EOF.
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    fault: AtomicU8,
}

impl StreamState {
    /// Record a fault; the first one wins
    pub(crate) fn mark(&self, fault: StreamFault) {
        let _ = self.fault.compare_exchange(
            FAULT_NONE,
            fault.code(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn fault(&self) -> Option<StreamFault> {
        StreamFault::from_code(self.fault.load(Ordering::Acquire))
    }
}

/// One logical byte stream carried over a [`Multiplexer`](super::Multiplexer).
///
/// Reads return EOF once the peer finishes the stream. If the stream was reset
/// or the transport failed, reads and writes return an error describing why.
#[derive(Debug)]
pub struct MuxStream {
    id: StreamId,
    io: DuplexStream,
    state: Arc<StreamState>,
}

impl MuxStream {
    pub(crate) fn new(id: StreamId, io: DuplexStream, state: Arc<StreamState>) -> Self {
        Self { id, io, state }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Abnormal termination cause, if any
    pub fn fault(&self) -> Option<StreamFault> {
        self.state.fault()
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.io).poll_read(cx, buf) {
            Poll::Ready(Ok(())) if buf.filled().len() == before && buf.remaining() > 0 => {
                match self.state.fault() {
                    Some(fault) => Poll::Ready(Err(fault.to_io_error())),
                    None => Poll::Ready(Ok(())),
                }
            }
            other => other,
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.io).poll_write(cx, buf) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(self.map_write_error(e))),
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.io).poll_flush(cx) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(self.map_write_error(e))),
            other => other,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl MuxStream {
    fn map_write_error(&self, e: io::Error) -> io::Error {
        match self.state.fault() {
            Some(fault) if e.kind() == io::ErrorKind::BrokenPipe => fault.to_io_error(),
            _ => e,
        }
    }
}
