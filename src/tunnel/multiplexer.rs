//! Stream multiplexer for the tunnel
//!
//! Manages many logical streams over a single secured connection using the
//! muxado framing the tunnel service speaks. Each session runs one reader and
//! one writer task on the connection; every stream gets a pair of pump tasks
//! that move bytes between its [`MuxStream`] handle and the frame queue.

use super::{
    ErrorCode, Frame, FrameType, MuxStream, Session, TunnelError, TunnelStream,
    DEFAULT_WINDOW_SIZE, MAX_STREAMS,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, DuplexStream};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// Pending inbound streams before new SYNs are refused
const ACCEPT_BACKLOG: usize = 128;

/// Buffer between a stream handle and its pumps
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Largest DATA payload we emit
const MAX_DATA_CHUNK: usize = 16 * 1024;

/// Which side of the session we are; decides stream ID parity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens odd stream IDs
    Client,
    /// Opens even stream IDs
    Server,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    fn is_remote_id(self, stream_id: u32) -> bool {
        match self {
            Role::Client => stream_id % 2 == 0,
            Role::Server => stream_id % 2 == 1,
        }
    }
}

/// Event sent from the session reader to a stream's inbound pump
#[derive(Debug)]
enum StreamEvent {
    /// Data received for stream
    Data(Bytes),
    /// Remote sent FIN
    Close,
}

/// Outbound side of a stream as seen by its pump
#[derive(Debug, Clone, Copy)]
struct SendState {
    window: u32,
    reset: bool,
}

/// Session state for a single stream
struct StreamEntry {
    stream: TunnelStream,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    send_state: Arc<watch::Sender<SendState>>,
}

impl StreamEntry {
    fn signal_reset(&self) {
        self.send_state.send_modify(|s| s.reset = true);
    }
}

/// State shared by the session handle, its I/O tasks and the stream pumps
struct Shared {
    role: Role,
    streams: Mutex<HashMap<u32, StreamEntry>>,
    frame_tx: mpsc::UnboundedSender<Frame>,
    closed: watch::Sender<bool>,
    /// Set once the writer has flushed and shut down the connection
    flushed: watch::Sender<bool>,
    last_remote_id: AtomicU32,
}

impl Shared {
    fn new(role: Role) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let (flushed, _) = watch::channel(false);

        let shared = Arc::new(Self {
            role,
            streams: Mutex::new(HashMap::new()),
            frame_tx,
            closed,
            flushed,
            last_remote_id: AtomicU32::new(0),
        });
        (shared, frame_rx)
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<u32, StreamEntry>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn queue(&self, frame: Frame) {
        trace!(
            "queue {:?} stream={} flags={:#x} len={}",
            frame.frame_type,
            frame.stream_id,
            frame.flags,
            frame.payload.len()
        );
        let _ = self.frame_tx.send(frame);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Register a stream and spawn its pumps
    fn register(self: &Arc<Self>, stream: TunnelStream) -> MuxStream {
        let stream_id = stream.id();
        let (user_io, pump_io) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (send_tx, _) = watch::channel(SendState {
            window: DEFAULT_WINDOW_SIZE,
            reset: false,
        });
        let send_state = Arc::new(send_tx);

        self.streams().insert(
            stream_id,
            StreamEntry {
                stream,
                event_tx,
                send_state: Arc::clone(&send_state),
            },
        );

        let (pump_read, pump_write) = tokio::io::split(pump_io);
        tokio::spawn(inbound_pump(Arc::clone(self), stream_id, event_rx, pump_write));
        tokio::spawn(outbound_pump(Arc::clone(self), stream_id, send_state, pump_read));

        MuxStream::new(stream_id, user_io)
    }

    /// Remove a stream, wake its pumps and tell the remote
    fn reset_stream(&self, stream_id: u32, code: ErrorCode) {
        if let Some(entry) = self.streams().remove(&stream_id) {
            entry.signal_reset();
            self.queue(Frame::rst(stream_id, code));
        }
    }

    /// Queue outbound data; false if the stream is gone
    fn send_data(&self, stream_id: u32, data: Bytes) -> bool {
        let mut streams = self.streams();
        match streams.get_mut(&stream_id) {
            Some(entry) => {
                let flags = if entry.stream.take_syn() { super::FLAG_SYN } else { 0 };
                self.queue(Frame::data(stream_id, data, flags));
                true
            }
            None => false,
        }
    }

    /// Local writer reached EOF: send FIN
    fn finish_local(&self, stream_id: u32) {
        let mut streams = self.streams();
        if let Some(entry) = streams.get_mut(&stream_id) {
            let syn = entry.stream.take_syn();
            self.queue(Frame::fin(stream_id, syn));
            entry.stream.close_local();
            if entry.stream.is_closed() {
                streams.remove(&stream_id);
            }
        }
    }

    /// Bytes reached the local reader: reopen the remote's window
    fn credit(&self, stream_id: u32, amount: u32) {
        if let Some(entry) = self.streams().get_mut(&stream_id) {
            entry.stream.apply_window_update(amount);
            self.queue(Frame::window_update(stream_id, amount));
        }
    }

    /// Handle an incoming frame
    fn handle_frame(
        self: &Arc<Self>,
        frame: Frame,
        accept_tx: &mpsc::Sender<MuxStream>,
    ) -> Result<(), TunnelError> {
        match frame.frame_type {
            FrameType::Data => {
                self.handle_data(frame, accept_tx);
                Ok(())
            }
            FrameType::WndInc => {
                let increment = frame.body_u32()?;
                if let Some(entry) = self.streams().get(&frame.stream_id) {
                    entry
                        .send_state
                        .send_modify(|s| s.window = s.window.saturating_add(increment));
                }
                Ok(())
            }
            FrameType::Rst => {
                let code = frame.body_u32().unwrap_or(ErrorCode::StreamReset as u32);
                debug!("Remote reset stream {} (code {})", frame.stream_id, code);
                if let Some(entry) = self.streams().remove(&frame.stream_id) {
                    entry.signal_reset();
                }
                Ok(())
            }
            FrameType::GoAway => {
                let code = if frame.payload.len() >= 8 {
                    u32::from_be_bytes([
                        frame.payload[4],
                        frame.payload[5],
                        frame.payload[6],
                        frame.payload[7],
                    ])
                } else {
                    ErrorCode::NoError as u32
                };
                Err(TunnelError::GoAway(code))
            }
        }
    }

    /// Handle incoming data frame, opening the stream first on SYN
    fn handle_data(self: &Arc<Self>, frame: Frame, accept_tx: &mpsc::Sender<MuxStream>) {
        let stream_id = frame.stream_id;

        if frame.is_syn() {
            if !self.role.is_remote_id(stream_id) || self.streams().contains_key(&stream_id) {
                warn!("Refusing invalid SYN for stream {}", stream_id);
                self.queue(Frame::rst(stream_id, ErrorCode::ProtocolError));
                return;
            }
            if self.streams().len() >= MAX_STREAMS as usize {
                self.queue(Frame::rst(stream_id, ErrorCode::StreamRefused));
                return;
            }

            self.last_remote_id.fetch_max(stream_id, Ordering::Relaxed);
            let handle = self.register(TunnelStream::inbound(stream_id));
            if accept_tx.try_send(handle).is_err() {
                warn!("Accept queue full, resetting stream {}", stream_id);
                self.reset_stream(stream_id, ErrorCode::AcceptQueueFull);
                return;
            }
            debug!("Remote opened stream {}", stream_id);
        }

        let mut streams = self.streams();
        let Some(entry) = streams.get_mut(&stream_id) else {
            trace!("Frame for unknown stream {}", stream_id);
            if !frame.payload.is_empty() {
                self.queue(Frame::rst(stream_id, ErrorCode::StreamClosed));
            }
            return;
        };

        if !frame.payload.is_empty() {
            if let Err(e) = entry.stream.consume_recv_window(frame.payload.len() as u32) {
                debug!("Stream {} violated receive rules: {}", stream_id, e);
                let code = match e {
                    TunnelError::FlowControl => ErrorCode::FlowControlError,
                    _ => ErrorCode::StreamClosed,
                };
                entry.signal_reset();
                streams.remove(&stream_id);
                self.queue(Frame::rst(stream_id, code));
                return;
            }
            let _ = entry.event_tx.send(StreamEvent::Data(frame.payload.clone()));
        }

        if frame.is_fin() {
            entry.stream.close_remote();
            let _ = entry.event_tx.send(StreamEvent::Close);
            if entry.stream.is_closed() {
                streams.remove(&stream_id);
            }
        }
    }

    /// Mark the session dead and release every stream
    fn shutdown(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let drained: Vec<StreamEntry> = self.streams().drain().map(|(_, entry)| entry).collect();
        debug!("Session closed, releasing {} streams", drained.len());
        for entry in drained {
            entry.signal_reset();
        }
    }
}

/// Multiplexed session over one secured connection
pub struct MuxSession {
    shared: Arc<Shared>,
    next_stream_id: AtomicU32,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
}

impl MuxSession {
    /// Start a client-side session (odd stream IDs) on `io`
    pub fn new_client<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, Role::Client)
    }

    /// Start a server-side session (even stream IDs) on `io`
    pub fn new_server<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, Role::Server)
    }

    fn new<T>(io: T, role: Role) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (shared, frame_rx) = Shared::new(role);

        tokio::spawn(write_loop(write_half, frame_rx, Arc::clone(&shared)));
        tokio::spawn(read_loop(read_half, accept_tx, Arc::clone(&shared)));

        Self {
            shared,
            next_stream_id: AtomicU32::new(role.first_stream_id()),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    /// Get this session's role
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Get number of active streams
    pub fn stream_count(&self) -> usize {
        self.shared.streams().len()
    }

    /// Whether the underlying connection is gone
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Send GOAWAY and stop the session
    pub fn close(&self) {
        if self.shared.is_closed() {
            return;
        }
        let last = self.shared.last_remote_id.load(Ordering::Relaxed);
        self.shared.queue(Frame::go_away(last, ErrorCode::NoError));
        self.shared.shutdown();
    }

    /// Wait until queued frames are written and the connection is shut down
    pub async fn closed(&self) {
        let mut flushed = self.shared.flushed.subscribe();
        let _ = flushed.wait_for(|done| *done).await;
    }
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("role", &self.role())
            .field("closed", &self.is_closed())
            .field("streams", &self.stream_count())
            .finish()
    }
}

#[async_trait]
impl Session for MuxSession {
    type Stream = MuxStream;

    async fn open(&self) -> Result<MuxStream, TunnelError> {
        if self.shared.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        if self.shared.streams().len() >= MAX_STREAMS as usize {
            return Err(TunnelError::TooManyStreams);
        }

        let stream_id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
        if stream_id > 0x7FFF_FFFF {
            return Err(TunnelError::TooManyStreams);
        }

        debug!("Opening stream {}", stream_id);
        Ok(self.shared.register(TunnelStream::outbound(stream_id)))
    }

    async fn accept(&self) -> Result<MuxStream, TunnelError> {
        let mut accept_rx = self.accept_rx.lock().await;
        accept_rx.recv().await.ok_or(TunnelError::SessionClosed)
    }
}

/// Delivers remote data and FIN to the stream handle
async fn inbound_pump(
    shared: Arc<Shared>,
    stream_id: u32,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    mut writer: WriteHalf<DuplexStream>,
) {
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Data(data) => {
                if writer.write_all(&data).await.is_err() {
                    // Handle dropped with data still arriving
                    shared.reset_stream(stream_id, ErrorCode::StreamClosed);
                    return;
                }
                shared.credit(stream_id, data.len() as u32);
            }
            StreamEvent::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

/// Moves bytes written to the stream handle onto the session, within the remote window
async fn outbound_pump(
    shared: Arc<Shared>,
    stream_id: u32,
    send_state: Arc<watch::Sender<SendState>>,
    mut reader: ReadHalf<DuplexStream>,
) {
    let mut state_rx = send_state.subscribe();
    let mut buf = vec![0u8; MAX_DATA_CHUNK];

    loop {
        let state = match state_rx.wait_for(|s| s.reset || s.window > 0).await {
            Ok(state) => *state,
            Err(_) => return,
        };
        if state.reset {
            return;
        }
        let limit = (state.window as usize).min(buf.len());

        let read = tokio::select! {
            read = reader.read(&mut buf[..limit]) => read,
            _ = async { let _ = state_rx.wait_for(|s| s.reset).await; } => return,
        };

        match read {
            Ok(0) => {
                shared.finish_local(stream_id);
                return;
            }
            Ok(n) => {
                send_state.send_modify(|s| s.window = s.window.saturating_sub(n as u32));
                if !shared.send_data(stream_id, Bytes::copy_from_slice(&buf[..n])) {
                    return;
                }
            }
            Err(e) => {
                debug!("Stream {} local read error: {}", stream_id, e);
                shared.reset_stream(stream_id, ErrorCode::StreamCancelled);
                return;
            }
        }
    }
}

/// Writes queued frames to the connection until the session closes
async fn write_loop<W>(
    writer: W,
    mut frame_rx: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    let mut closed_rx = shared.closed.subscribe();

    let result: Result<(), TunnelError> = async {
        loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    let Some(frame) = frame else { return Ok(()) };
                    writer.write_all(&frame.encode()?).await?;
                    writer.flush().await?;
                }
                _ = async { let _ = closed_rx.wait_for(|closed| *closed).await; } => {
                    // Flush what was queued before the close (GOAWAY, RSTs)
                    while let Ok(frame) = frame_rx.try_recv() {
                        writer.write_all(&frame.encode()?).await?;
                    }
                    writer.flush().await?;
                    return Ok(());
                }
            }
        }
    }
    .await;

    if let Err(e) = result {
        debug!("Session writer stopped: {}", e);
    }
    let _ = writer.shutdown().await;
    shared.shutdown();
    shared.flushed.send_replace(true);
}

/// Reads frames from the connection and dispatches them to streams
async fn read_loop<R>(mut reader: R, accept_tx: mpsc::Sender<MuxStream>, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut closed_rx = shared.closed.subscribe();

    let result: Result<(), TunnelError> = async {
        loop {
            while let Some(frame) = Frame::decode(&mut buf)? {
                shared.handle_frame(frame, &accept_tx)?;
            }

            let n = tokio::select! {
                n = reader.read_buf(&mut buf) => n?,
                _ = async { let _ = closed_rx.wait_for(|closed| *closed).await; } => return Ok(()),
            };
            if n == 0 {
                return Err(TunnelError::SessionClosed);
            }
        }
    }
    .await;

    match result {
        Ok(()) => debug!("Session reader stopped"),
        Err(e) => debug!("Session reader stopped: {}", e),
    }
    shared.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::FLAG_SYN;

    use std::time::Duration;

    fn session_pair() -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (MuxSession::new_client(a), MuxSession::new_server(b))
    }

    /// Client session whose peer is driven frame by frame
    fn raw_peer() -> (MuxSession, DuplexStream) {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        (MuxSession::new_client(a), b)
    }

    async fn send_frame(io: &mut DuplexStream, frame: Frame) {
        io.write_all(&frame.encode().unwrap()).await.unwrap();
    }

    async fn next_frame(io: &mut DuplexStream, buf: &mut BytesMut) -> Frame {
        loop {
            if let Some(frame) = Frame::decode(buf).unwrap() {
                return frame;
            }
            let n = io.read_buf(buf).await.unwrap();
            assert!(n > 0, "session hung up");
        }
    }

    async fn next_rst(io: &mut DuplexStream, buf: &mut BytesMut) -> Frame {
        loop {
            let frame = next_frame(io, buf).await;
            if frame.frame_type == FrameType::Rst {
                return frame;
            }
        }
    }

    #[test]
    fn test_io_loops_are_send() {
        fn assert_send<T: Send>(_: T) {}

        let (shared, frame_rx) = Shared::new(Role::Client);
        let (accept_tx, _accept_rx) = mpsc::channel(1);
        assert_send(write_loop(tokio::io::sink(), frame_rx, Arc::clone(&shared)));
        assert_send(read_loop(tokio::io::empty(), accept_tx, shared));
    }

    #[tokio::test]
    async fn test_debug_output() {
        let (client, _server) = session_pair();
        let _stream = client.open().await.unwrap();

        let rendered = format!("{:?}", client);
        assert!(rendered.contains("Client"));
        assert!(rendered.contains("streams: 1"));
    }

    #[tokio::test]
    async fn test_stream_ids_follow_role() {
        let (client, server) = session_pair();

        let first = client.open().await.unwrap();
        let second = client.open().await.unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 3);

        let from_server = server.open().await.unwrap();
        assert_eq!(from_server.id(), 2);
        assert_eq!(client.role(), Role::Client);
        assert_eq!(server.role(), Role::Server);
    }

    #[tokio::test]
    async fn test_open_accept_roundtrip() {
        let (client, server) = session_pair();

        let mut outbound = client.open().await.unwrap();
        outbound.write_all(b"ping").await.unwrap();

        let mut inbound = server.accept().await.unwrap();
        assert_eq!(inbound.id(), 1);

        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        inbound.write_all(b"pong").await.unwrap();
        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_shutdown_sends_fin() {
        let (client, server) = session_pair();

        let mut outbound = client.open().await.unwrap();
        outbound.write_all(b"last words").await.unwrap();
        outbound.shutdown().await.unwrap();

        let mut inbound = server.accept().await.unwrap();
        let mut received = Vec::new();
        inbound.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"last words");

        // The other direction stays usable after a half close
        inbound.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }

    #[tokio::test]
    async fn test_transfer_larger_than_window() {
        let (client, server) = session_pair();
        let payload: Vec<u8> = (0..(DEFAULT_WINDOW_SIZE as usize * 3))
            .map(|i| (i % 251) as u8)
            .collect();

        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            let mut outbound = client.open().await.unwrap();
            outbound.write_all(&payload).await.unwrap();
            outbound.shutdown().await.unwrap();
            client
        });

        let mut inbound = server.accept().await.unwrap();
        let mut received = Vec::new();
        inbound.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_handle_ends_remote_reader() {
        let (client, server) = session_pair();

        let mut outbound = client.open().await.unwrap();
        outbound.write_all(b"x").await.unwrap();
        let mut inbound = server.accept().await.unwrap();

        drop(outbound);

        let mut received = Vec::new();
        inbound.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"x");
    }

    #[tokio::test]
    async fn test_goaway_closes_accept() {
        let (client, server) = session_pair();

        server.close();

        assert!(matches!(
            client.accept().await,
            Err(TunnelError::SessionClosed)
        ));
        assert!(client.is_closed());
        assert!(matches!(client.open().await, Err(TunnelError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_close_flushes_goaway() {
        let (client, mut peer) = raw_peer();

        client.close();
        client.closed().await;

        let mut buf = BytesMut::new();
        let frame = next_frame(&mut peer, &mut buf).await;
        assert_eq!(frame.frame_type, FrameType::GoAway);
        assert_eq!(frame.stream_id, 0);
    }

    #[tokio::test]
    async fn test_window_overrun_resets_stream() {
        let (client, mut peer) = raw_peer();

        let oversized = Bytes::from(vec![0u8; DEFAULT_WINDOW_SIZE as usize + 1]);
        send_frame(&mut peer, Frame::data(2, oversized, FLAG_SYN)).await;

        let mut buf = BytesMut::new();
        let rst = next_rst(&mut peer, &mut buf).await;
        assert_eq!(rst.stream_id, 2);
        assert_eq!(rst.body_u32().unwrap(), ErrorCode::FlowControlError as u32);

        // The accepted handle sees the stream end without the rejected bytes
        let mut stream = client.accept().await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_remote_reset_ends_stream() {
        let (client, mut peer) = raw_peer();

        send_frame(
            &mut peer,
            Frame::data(2, Bytes::from_static(b"hi"), FLAG_SYN),
        )
        .await;
        let mut stream = client.accept().await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        send_frame(&mut peer, Frame::rst(2, ErrorCode::StreamReset)).await;

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        // Both pumps exit on reset, after which writes have nowhere to go
        let write_failed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if stream.write_all(b"late").await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(write_failed.is_ok());
        assert_eq!(client.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_accept_backlog_overflow_resets_stream() {
        let (client, mut peer) = raw_peer();

        let overflow_id = 2 * (ACCEPT_BACKLOG as u32 + 1);
        for stream_id in (2..=overflow_id).step_by(2) {
            send_frame(&mut peer, Frame::data(stream_id, Bytes::new(), FLAG_SYN)).await;
        }

        let mut buf = BytesMut::new();
        let rst = next_rst(&mut peer, &mut buf).await;
        assert_eq!(rst.stream_id, overflow_id);
        assert_eq!(rst.body_u32().unwrap(), ErrorCode::AcceptQueueFull as u32);
        assert_eq!(client.stream_count(), ACCEPT_BACKLOG);

        // Everything before the overflow is still waiting to be accepted
        for stream_id in (2..overflow_id).step_by(2) {
            assert_eq!(client.accept().await.unwrap().id(), stream_id);
        }
    }

    #[tokio::test]
    async fn test_concurrent_streams_are_independent() {
        let (client, server) = session_pair();

        let mut a = client.open().await.unwrap();
        let mut b = client.open().await.unwrap();
        a.write_all(b"aaaa").await.unwrap();
        b.write_all(b"bbbb").await.unwrap();

        let x = server.accept().await.unwrap();
        let y = server.accept().await.unwrap();
        let (mut first, mut second) = if x.id() == a.id() { (x, y) } else { (y, x) };
        assert_eq!(second.id(), b.id());

        drop(a);
        let mut rest = Vec::new();
        first.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"aaaa");

        let mut buf = [0u8; 4];
        second.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"bbbb");
        second.write_all(b"more").await.unwrap();
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"more");
    }
}
