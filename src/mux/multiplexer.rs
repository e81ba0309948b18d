//! Stream Multiplexer
//!
//! Carries many independent byte streams over one ordered, reliable
//! connection. Each stream gets its own credit window so a slow reader on one
//! stream never stalls the others.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::frame::{Frame, FrameCodec, FrameKind, StreamId, CONNECTION_STREAM_ID, MAX_FRAME_PAYLOAD};
use super::stream::{MuxStream, StreamFault, StreamState};
use crate::config::MuxConfig;
use crate::error::TunnelError;

/// Outbound frame queue depth shared by all streams
const FRAME_QUEUE: usize = 256;

/// Which side of the transport this multiplexer runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Opens odd-numbered streams
    Client,
    /// Opens even-numbered streams
    Server,
}

impl Role {
    fn first_stream_id(self) -> StreamId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    fn owns(self, id: StreamId) -> bool {
        match self {
            Role::Client => id % 2 == 1,
            Role::Server => id % 2 == 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Local,
    Eof,
    Broken,
    Timeout,
}

struct StreamSlot {
    inbound: Option<mpsc::UnboundedSender<Bytes>>,
    /// Bytes received but not yet handed back to the peer as credit
    unacked: Arc<AtomicU32>,
    window: Arc<Semaphore>,
    state: Arc<StreamState>,
}

struct Shared {
    role: Role,
    config: MuxConfig,
    frame_tx: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<StreamId, StreamSlot>>,
    next_id: AtomicU32,
    cancel: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
    last_seen: Mutex<Instant>,
}

/// Everything a stream pump task needs
struct Pump {
    id: StreamId,
    internal: DuplexStream,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    unacked: Arc<AtomicU32>,
    window: Arc<Semaphore>,
    state: Arc<StreamState>,
}

impl Shared {
    fn shutdown(&self, reason: CloseReason) {
        {
            let mut current = self.close_reason.lock();
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.cancel.cancel();
    }

    fn close_error(&self) -> TunnelError {
        match *self.close_reason.lock() {
            Some(CloseReason::Timeout) => TunnelError::Timeout,
            _ => TunnelError::TransportClosed,
        }
    }

    fn stream_fault(&self) -> StreamFault {
        match *self.close_reason.lock() {
            Some(CloseReason::Timeout) => StreamFault::TimedOut,
            _ => StreamFault::Aborted,
        }
    }

    async fn send(&self, frame: Frame) -> Result<(), TunnelError> {
        self.frame_tx
            .send(frame)
            .await
            .map_err(|_| self.close_error())
    }

    /// Create the bookkeeping for a new stream. The pump must be spawned by
    /// the caller once any Open frame has been queued.
    fn register(&self, id: StreamId) -> (MuxStream, Pump) {
        let (user, internal) = tokio::io::duplex(self.config.stream_buffer);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let unacked = Arc::new(AtomicU32::new(0));
        let window = Arc::new(Semaphore::new(self.config.max_stream_window as usize));
        let state = Arc::new(StreamState::default());

        self.streams.lock().insert(
            id,
            StreamSlot {
                inbound: Some(inbound_tx),
                unacked: unacked.clone(),
                window: window.clone(),
                state: state.clone(),
            },
        );

        let pump = Pump {
            id,
            internal,
            inbound: inbound_rx,
            unacked,
            window,
            state: state.clone(),
        };
        (MuxStream::new(id, user, state), pump)
    }

    /// Fail a stream on this side and tell the peer
    fn reset_stream(&self, id: StreamId) {
        if let Some(slot) = self.streams.lock().get_mut(&id) {
            slot.state.mark(StreamFault::Reset);
            slot.inbound.take();
            slot.window.close();
        }
        let _ = self.frame_tx.try_send(Frame::reset(id));
    }

    /// Apply one inbound frame. Returns a stream the peer just opened.
    fn handle_frame(self: &Arc<Self>, frame: Frame) -> Option<MuxStream> {
        let id = frame.stream_id;
        match frame.kind {
            FrameKind::Ping => None,
            FrameKind::Open => {
                if id == CONNECTION_STREAM_ID
                    || self.role.owns(id)
                    || self.streams.lock().contains_key(&id)
                {
                    warn!(stream_id = id, "Peer opened an invalid stream id, resetting");
                    let _ = self.frame_tx.try_send(Frame::reset(id));
                    return None;
                }
                // the dialing side never accepts streams
                if self.role == Role::Client {
                    debug!(stream_id = id, "Refusing server-opened stream");
                    let _ = self.frame_tx.try_send(Frame::reset(id));
                    return None;
                }
                let (stream, pump) = self.register(id);
                tokio::spawn(run_pump(self.clone(), pump));
                Some(stream)
            }
            FrameKind::Data => {
                let len = frame.payload.len() as u32;
                let overrun = match self.streams.lock().get(&id) {
                    Some(StreamSlot {
                        inbound: Some(tx),
                        unacked,
                        ..
                    }) => {
                        let pending = unacked.fetch_add(len, Ordering::AcqRel) + len;
                        if pending > self.config.max_stream_window {
                            true
                        } else {
                            let _ = tx.send(frame.payload);
                            false
                        }
                    }
                    _ => {
                        trace!(stream_id = id, "Dropping data for finished stream");
                        false
                    }
                };
                if overrun {
                    warn!(stream_id = id, "Peer overran the stream window, resetting");
                    self.reset_stream(id);
                }
                None
            }
            FrameKind::Fin => {
                if let Some(slot) = self.streams.lock().get_mut(&id) {
                    slot.inbound.take();
                }
                None
            }
            FrameKind::Reset => {
                if let Some(slot) = self.streams.lock().get_mut(&id) {
                    slot.state.mark(StreamFault::Reset);
                    slot.inbound.take();
                    slot.window.close();
                }
                None
            }
            FrameKind::WindowUpdate => {
                if let Some(credit) = frame.credit() {
                    if let Some(slot) = self.streams.lock().get(&id) {
                        slot.window.add_permits(credit as usize);
                    }
                }
                None
            }
        }
    }
}

/// A multiplexed transport over one ordered byte connection
pub struct Multiplexer {
    shared: Arc<Shared>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
}

impl Multiplexer {
    /// Multiplexer for the side that dialed the connection
    pub fn client<T>(io: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, Role::Client, config)
    }

    /// Multiplexer for the side that accepted the connection
    pub fn server<T>(io: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, Role::Server, config)
    }

    fn new<T>(io: T, role: Role, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let (incoming_tx, incoming_rx) = mpsc::channel(config.accept_backlog.max(1));

        let shared = Arc::new(Shared {
            role,
            config,
            frame_tx,
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(role.first_stream_id()),
            cancel: CancellationToken::new(),
            close_reason: Mutex::new(None),
            last_seen: Mutex::new(Instant::now()),
        });

        tokio::spawn(write_loop(
            FramedWrite::new(writer, FrameCodec),
            frame_rx,
            shared.clone(),
        ));
        tokio::spawn(read_loop(
            FramedRead::new(reader, FrameCodec),
            shared.clone(),
            incoming_tx,
        ));
        tokio::spawn(keepalive_loop(shared.clone()));

        Self {
            shared,
            incoming: tokio::sync::Mutex::new(incoming_rx),
        }
    }

    /// Open a new outbound stream
    pub async fn open_stream(&self) -> Result<MuxStream, TunnelError> {
        if self.shared.cancel.is_cancelled() {
            return Err(self.shared.close_error());
        }

        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let (stream, pump) = self.shared.register(id);
        if let Err(e) = self.shared.send(Frame::open(id)).await {
            self.shared.streams.lock().remove(&id);
            return Err(e);
        }
        tokio::spawn(run_pump(self.shared.clone(), pump));

        debug!(stream_id = id, "Opened stream");
        Ok(stream)
    }

    /// Wait for the peer to open a stream. Fails permanently once the
    /// transport is closed.
    pub async fn accept_stream(&self) -> Result<MuxStream, TunnelError> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            stream = incoming.recv() => stream.ok_or_else(|| self.shared.close_error()),
            _ = self.shared.cancel.cancelled() => Err(self.shared.close_error()),
        }
    }

    /// Close the transport, failing every stream carried by it
    pub fn close(&self) {
        self.shared.shutdown(CloseReason::Local);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Resolves once the transport has closed for any reason
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await
    }

    /// Error describing why the transport closed
    pub fn close_error(&self) -> TunnelError {
        self.shared.close_error()
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shared.shutdown(CloseReason::Local);
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<WriteHalf<W>, FrameCodec>,
    mut frames: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
) where
    W: AsyncRead + AsyncWrite,
{
    loop {
        let frame = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let batch = async {
            sink.feed(frame).await?;
            while let Ok(next) = frames.try_recv() {
                sink.feed(next).await?;
            }
            sink.flush().await
        };

        let result = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            result = batch => result,
        };

        if let Err(e) = result {
            debug!(error = %e, "Transport write failed");
            shared.shutdown(CloseReason::Broken);
            break;
        }
    }

    let _ = sink.close().await;
}

async fn read_loop<R>(
    mut source: FramedRead<ReadHalf<R>, FrameCodec>,
    shared: Arc<Shared>,
    incoming: mpsc::Sender<MuxStream>,
) where
    R: AsyncRead + AsyncWrite,
{
    let reason = loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            next = source.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                *shared.last_seen.lock() = Instant::now();
                if let Some(stream) = shared.handle_frame(frame) {
                    // never block frame processing on a slow acceptor
                    if let Err(e) = incoming.try_send(stream) {
                        let id = e.into_inner().id();
                        warn!(stream_id = id, "Accept backlog full, resetting stream");
                        shared.reset_stream(id);
                    }
                }
            }
            Some(Err(e)) => {
                debug!(error = %e, "Transport read failed");
                break CloseReason::Broken;
            }
            None => break CloseReason::Eof,
        }
    };

    shared.shutdown(reason);
}

async fn keepalive_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.keepalive_interval);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let idle = shared.last_seen.lock().elapsed();
        if idle > shared.config.keepalive_timeout {
            warn!(idle = ?idle, "Transport keepalive timed out");
            shared.shutdown(CloseReason::Timeout);
            return;
        }
        let _ = shared.frame_tx.try_send(Frame::ping());
    }
}

/// Moves bytes between a stream's user-facing end and the transport
async fn run_pump(shared: Arc<Shared>, pump: Pump) {
    let Pump {
        id,
        internal,
        mut inbound,
        unacked,
        window,
        state,
    } = pump;
    let (mut rd, mut wr) = tokio::io::split(internal);
    let chunk = MAX_FRAME_PAYLOAD.min(shared.config.max_stream_window as usize);

    let outbound = async {
        let mut buf = vec![0u8; chunk];
        loop {
            let n = match rd.read(&mut buf).await {
                Ok(0) => {
                    let _ = shared.send(Frame::fin(id)).await;
                    return;
                }
                Ok(n) => n,
                Err(_) => {
                    let _ = shared.send(Frame::reset(id)).await;
                    return;
                }
            };
            match window.acquire_many(n as u32).await {
                Ok(permits) => permits.forget(),
                Err(_) => return,
            }
            if shared
                .send(Frame::data(id, Bytes::copy_from_slice(&buf[..n])))
                .await
                .is_err()
            {
                return;
            }
        }
    };

    let deliver = async {
        while let Some(chunk) = inbound.recv().await {
            let len = chunk.len() as u32;
            if wr.write_all(&chunk).await.is_err() {
                let _ = shared.send(Frame::reset(id)).await;
                return;
            }
            unacked.fetch_sub(len, Ordering::AcqRel);
            let _ = shared.send(Frame::window_update(id, len)).await;
        }
        let _ = wr.shutdown().await;
    };

    tokio::select! {
        _ = async { tokio::join!(outbound, deliver) } => {}
        _ = shared.cancel.cancelled() => {
            state.mark(shared.stream_fault());
        }
    }

    shared.streams.lock().remove(&id);
    trace!(stream_id = id, "Stream finished");
}
