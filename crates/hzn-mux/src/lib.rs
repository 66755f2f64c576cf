//! Stream multiplexing over a single authenticated connection
//!
//! A [`Session`] owns one physical byte stream (usually TLS) and carries any
//! number of independent logical [`MuxStream`]s over it. Each logical stream
//! is a plain `AsyncRead + AsyncWrite`, so frame codecs and copy loops work on
//! it unchanged.
//!
//! ```text
//! ┌──────────────┐  frames   ┌──────────────┐
//! │  MuxStream 1 │──┐     ┌──│  MuxStream 1 │
//! │  MuxStream 3 │──┼─TLS─┼──│  MuxStream 3 │
//! │  MuxStream 5 │──┘     └──│  MuxStream 5 │
//! └──────────────┘           └──────────────┘
//!     client                     server
//! ```
//!
//! Clients allocate odd stream ids, servers even ones. An optional keep-alive
//! pings idle connections so dead peers are noticed without relying on
//! stream traffic. Every stream is flow controlled by a receive window that
//! the reader replenishes with `WindowUpdate` frames as it consumes data.

pub mod config;
pub mod frame;
pub mod session;
pub mod stream;

pub use config::MuxConfig;
pub use frame::{Frame, FrameFlags, FrameType, MuxCodec, StreamId};
pub use session::{Mode, Session};
pub use stream::MuxStream;

use thiserror::Error;

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Session shut down")]
    SessionShutdown,

    #[error("Keep-alive timed out")]
    KeepAliveTimeout,

    #[error("No available stream IDs")]
    StreamsExhausted,
}

pub type MuxResult<T> = Result<T, MuxError>;
