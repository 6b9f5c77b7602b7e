//! Tunnel layer - multiplexed session over the secured control connection
//!
//! Provides:
//! - The [`Session`] capability the client is written against
//! - Frame encoding/decoding for the muxado wire format
//! - Stream multiplexing with per-stream flow control

mod frame;
mod multiplexer;
mod stream;

pub use frame::{ErrorCode, Frame, FrameType, FLAG_FIN, FLAG_SYN, FRAME_HEADER_SIZE};
pub use multiplexer::{MuxSession, Role};
pub use stream::{MuxStream, StreamState, TunnelStream};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Flow control violation")]
    FlowControl,

    #[error("Too many streams")]
    TooManyStreams,

    #[error("Session closed")]
    SessionClosed,

    #[error("Remote went away (code {0})")]
    GoAway(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A multiplexed session: many logical byte streams over one connection
///
/// Both operations take `&self` and may be called concurrently.
#[async_trait]
pub trait Session: Send + Sync {
    /// Logical stream type
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new outbound stream
    async fn open(&self) -> Result<Self::Stream, TunnelError>;

    /// Wait for the next stream opened by the remote
    async fn accept(&self) -> Result<Self::Stream, TunnelError>;
}

/// Maximum number of concurrent streams
pub const MAX_STREAMS: u32 = 1024;

/// Initial per-stream window in each direction (256 KB)
pub const DEFAULT_WINDOW_SIZE: u32 = 262144;
