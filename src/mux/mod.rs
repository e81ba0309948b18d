//! Stream Multiplexing
//!
//! Turns one encrypted connection into many independent logical streams.
//! The first stream of every session is the control stream; every later one
//! carries a single proxied connection.

pub mod frame;
pub mod multiplexer;
pub mod stream;

pub use frame::{Frame, FrameCodec, FrameKind, StreamId, MAX_FRAME_PAYLOAD};
pub use multiplexer::Multiplexer;
pub use stream::{MuxStream, StreamFault};
