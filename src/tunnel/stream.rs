//! Multiplexed stream implementation

use super::{TunnelError, DEFAULT_WINDOW_SIZE};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream is open and active
    Open,
    /// Local side has sent FIN
    HalfClosedLocal,
    /// Remote side has sent FIN
    HalfClosedRemote,
    /// Stream is fully closed
    Closed,
}

/// Session-side bookkeeping for one stream
#[derive(Debug)]
pub struct TunnelStream {
    /// Stream ID
    id: u32,
    /// Current state
    state: StreamState,
    /// Bytes the remote may still send before we credit the window
    recv_window: u32,
    /// Whether the SYN flag has gone out (locally opened streams only)
    announced: bool,
}

impl TunnelStream {
    /// Create a stream we opened; it is announced with its first frame
    pub fn outbound(id: u32) -> Self {
        Self {
            id,
            state: StreamState::Open,
            recv_window: DEFAULT_WINDOW_SIZE,
            announced: false,
        }
    }

    /// Create a stream the remote opened with SYN
    pub fn inbound(id: u32) -> Self {
        Self {
            announced: true,
            ..Self::outbound(id)
        }
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Get current state
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Returns true exactly once: the first outbound frame must carry SYN
    pub fn take_syn(&mut self) -> bool {
        !std::mem::replace(&mut self.announced, true)
    }

    /// Check if stream can receive data
    pub fn can_recv(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Remaining receive window
    pub fn recv_window(&self) -> u32 {
        self.recv_window
    }

    /// Account for inbound data against the receive window
    pub fn consume_recv_window(&mut self, amount: u32) -> Result<(), TunnelError> {
        if !self.can_recv() {
            return Err(TunnelError::StreamClosed);
        }
        if amount > self.recv_window {
            return Err(TunnelError::FlowControl);
        }
        self.recv_window -= amount;
        Ok(())
    }

    /// Credit the receive window after delivering bytes to the reader
    pub fn apply_window_update(&mut self, increment: u32) {
        self.recv_window = self.recv_window.saturating_add(increment);
    }

    /// Close local side
    pub fn close_local(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            _ => self.state,
        };
    }

    /// Close remote side
    pub fn close_remote(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            _ => self.state,
        };
    }

    /// Check if stream is fully closed
    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }
}

/// Application handle for one logical stream of a [`MuxSession`](super::MuxSession)
///
/// Reads return EOF after the remote sends FIN or RST. `shutdown()` sends FIN;
/// dropping the handle closes the stream.
#[derive(Debug)]
pub struct MuxStream {
    id: u32,
    io: DuplexStream,
}

impl MuxStream {
    pub(super) fn new(id: u32, io: DuplexStream) -> Self {
        Self { id, io }
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
