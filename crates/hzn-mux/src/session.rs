//! Multiplexed session over one physical connection

use crate::config::MuxConfig;
use crate::frame::{Frame, FrameType, MuxCodec, StreamId};
use crate::stream::{MuxStream, Window};
use crate::{MuxError, MuxResult};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Outbound frames queued ahead of the writer task
const FRAME_QUEUE_SIZE: usize = 1024;

/// Which end of the connection this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Dialed the connection; allocates odd stream ids
    Client,
    /// Accepted the connection; allocates even stream ids
    Server,
}

/// A multiplexed session
///
/// Dropping the session shuts it down; every open [`MuxStream`] then sees EOF.
pub struct Session {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
}

impl Session {
    /// Start a client session on `io`
    pub fn client<T>(io: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::from_parts(reader, writer, config, Mode::Client)
    }

    /// Start a server session on `io`
    pub fn server<T>(io: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::from_parts(reader, writer, config, Mode::Server)
    }

    /// Start a session on separate read and write halves
    ///
    /// Used when a handshake has already consumed (and possibly read ahead
    /// on) the connection.
    pub fn from_parts<R, W>(reader: R, writer: W, config: MuxConfig, mode: Mode) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE_SIZE);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let codec = MuxCodec::new(config.max_frame_size);

        let first_id = match mode {
            Mode::Client => 1,
            Mode::Server => 2,
        };

        let shared = Arc::new(Shared {
            mode,
            config,
            frames: frames_tx,
            streams: Mutex::new(HashMap::new()),
            active_streams: AtomicUsize::new(0),
            next_stream_id: AtomicU32::new(first_id),
            next_ping_id: AtomicU32::new(0),
            pings: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            error: Mutex::new(None),
        });

        tokio::spawn(write_loop(
            FramedWrite::new(writer, codec.clone()),
            frames_rx,
            shared.clone(),
        ));
        tokio::spawn(read_loop(
            FramedRead::new(reader, codec),
            shared.clone(),
            accept_tx,
        ));
        if shared.config.enable_keep_alive {
            tokio::spawn(keep_alive_loop(shared.clone()));
        }

        debug!(mode = ?mode, "Mux session started");

        Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    /// Open a new outbound stream
    pub async fn open_stream(&self) -> MuxResult<MuxStream> {
        if self.is_closed() {
            return Err(MuxError::SessionShutdown);
        }

        let id = self.shared.next_stream_id.fetch_add(2, Ordering::Relaxed);
        if id >= u32::MAX - 1 {
            return Err(MuxError::StreamsExhausted);
        }

        let stream = MuxStream::spawn(self.shared.clone(), id);
        self.shared.send(Frame::syn(id)).await?;

        debug!("Opened stream: {}", id);
        Ok(stream)
    }

    /// Wait for the next inbound stream
    ///
    /// Returns `Ok(None)` once the peer has disconnected, or the error that
    /// ended the session.
    pub async fn accept_stream(&self) -> MuxResult<Option<MuxStream>> {
        let mut accept_rx = self.accept_rx.lock().await;

        match accept_rx.recv().await {
            Some(stream) => Ok(Some(stream)),
            None => match self.shared.take_error() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }

    /// Round-trip a ping through the peer
    pub async fn ping(&self) -> MuxResult<Duration> {
        self.shared.ping().await
    }

    /// Tell the peer we are going away and shut the session down
    pub fn close(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }

        let _ = self.shared.frames.try_send(Frame::go_away());
        self.shared.shutdown.cancel();
    }

    /// Resolves once the session has shut down
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Number of logical streams still open
    pub fn num_streams(&self) -> usize {
        self.shared.active_streams.load(Ordering::Relaxed)
    }

    pub fn mode(&self) -> Mode {
        self.shared.mode
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.shared.mode)
            .field("streams", &self.num_streams())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// State shared between the session handle, its tasks and its streams
pub(crate) struct Shared {
    mode: Mode,
    pub(crate) config: MuxConfig,
    frames: mpsc::Sender<Frame>,
    /// Open streams, until their pump finishes
    streams: Mutex<HashMap<StreamId, StreamEntry>>,
    active_streams: AtomicUsize,
    next_stream_id: AtomicU32,
    next_ping_id: AtomicU32,
    pings: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    pub(crate) shutdown: CancellationToken,
    error: Mutex<Option<MuxError>>,
}

/// Session-side handles of one open stream
struct StreamEntry {
    /// Dropped once the peer has finished or reset its side
    inbound: Option<mpsc::UnboundedSender<Bytes>>,
    window: Arc<Window>,
}

impl Shared {
    pub(crate) async fn send(&self, frame: Frame) -> MuxResult<()> {
        self.frames
            .send(frame)
            .await
            .map_err(|_| MuxError::SessionShutdown)
    }

    pub(crate) fn register_stream(
        &self,
        id: StreamId,
        inbound: mpsc::UnboundedSender<Bytes>,
        window: Arc<Window>,
    ) {
        let entry = StreamEntry {
            inbound: Some(inbound),
            window,
        };
        lock(&self.streams).insert(id, entry);
        self.active_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stream_finished(&self, id: StreamId) {
        lock(&self.streams).remove(&id);
        self.active_streams.fetch_sub(1, Ordering::Relaxed);
        trace!("Stream {} finished", id);
    }

    fn end_inbound(&self, id: StreamId) {
        if let Some(entry) = lock(&self.streams).get_mut(&id) {
            entry.inbound = None;
        }
    }

    /// Abort both directions of stream `id`
    fn reset_stream(&self, id: StreamId) {
        if let Some(entry) = lock(&self.streams).get_mut(&id) {
            entry.inbound = None;
            entry.window.reset();
        }
    }

    fn is_remote_id(&self, id: StreamId) -> bool {
        match self.mode {
            Mode::Client => id % 2 == 0 && id != 0,
            Mode::Server => id % 2 == 1,
        }
    }

    /// Record the error that ends the session and shut it down
    fn fail(&self, err: MuxError) {
        warn!("Mux session failed: {}", err);
        let mut slot = lock(&self.error);
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        self.shutdown.cancel();
    }

    fn take_error(&self) -> Option<MuxError> {
        lock(&self.error).take()
    }

    /// Drop all inbound channels so stream readers see EOF
    fn close_streams(&self) {
        for (_, entry) in lock(&self.streams).drain() {
            entry.window.reset();
        }
        lock(&self.pings).clear();
    }

    async fn ping(&self) -> MuxResult<Duration> {
        let id = self.next_ping_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pings).insert(id, tx);

        let start = Instant::now();
        if let Err(e) = self.send(Frame::ping(id)).await {
            lock(&self.pings).remove(&id);
            return Err(e);
        }

        tokio::select! {
            reply = rx => reply.map_err(|_| MuxError::SessionShutdown)?,
            _ = self.shutdown.cancelled() => return Err(MuxError::SessionShutdown),
        }

        Ok(start.elapsed())
    }

    /// Process one inbound frame; `Ok(false)` means the peer is going away
    async fn handle_frame(
        self: &Arc<Self>,
        frame: Frame,
        accept_tx: &mpsc::Sender<MuxStream>,
    ) -> MuxResult<bool> {
        trace!(
            "Processing frame: stream_id={}, type={:?}, size={}",
            frame.stream_id,
            frame.frame_type,
            frame.payload.len()
        );

        match frame.frame_type {
            FrameType::Data => {
                let id = frame.stream_id;
                let flags = frame.flags;

                if flags.has_syn() {
                    self.accept_remote_stream(id, accept_tx).await?;
                }

                if flags.has_rst() {
                    debug!("Stream {} reset by peer", id);
                    self.reset_stream(id);
                    return Ok(true);
                }

                if !frame.payload.is_empty() && !self.deliver(id, frame.payload) {
                    warn!("Stream {} overran its receive window, resetting", id);
                    self.reset_stream(id);
                    self.send(Frame::rst(id)).await?;
                    return Ok(true);
                }

                if flags.has_fin() {
                    self.end_inbound(id);
                }
            }
            FrameType::WindowUpdate => {
                let delta = frame
                    .window_delta()
                    .ok_or_else(|| MuxError::ProtocolError("malformed window update".to_string()))?;

                if let Some(entry) = lock(&self.streams).get(&frame.stream_id) {
                    entry.window.grant(delta);
                }
            }
            FrameType::Ping => {
                let opaque = frame
                    .ping_opaque()
                    .ok_or_else(|| MuxError::ProtocolError("malformed ping".to_string()))?;

                if frame.flags.has_ack() {
                    if let Some(waiter) = lock(&self.pings).remove(&opaque) {
                        let _ = waiter.send(());
                    }
                } else {
                    self.send(Frame::pong(opaque)).await?;
                }
            }
            FrameType::GoAway => {
                debug!("Peer sent go-away");
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Queue inbound data for stream `id`; `false` if it overran the window
    fn deliver(&self, id: StreamId, payload: Bytes) -> bool {
        let streams = lock(&self.streams);
        let Some(entry) = streams.get(&id) else {
            trace!("Dropping data for unknown stream {}", id);
            return true;
        };
        let Some(inbound) = &entry.inbound else {
            trace!("Dropping data for finished stream {}", id);
            return true;
        };

        let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        if !entry.window.consume_recv(len) {
            return false;
        }
        let _ = inbound.send(payload);
        true
    }

    async fn accept_remote_stream(
        self: &Arc<Self>,
        id: StreamId,
        accept_tx: &mpsc::Sender<MuxStream>,
    ) -> MuxResult<()> {
        if !self.is_remote_id(id) {
            return Err(MuxError::ProtocolError(format!(
                "peer opened stream {} with our parity",
                id
            )));
        }
        if lock(&self.streams).contains_key(&id) {
            return Err(MuxError::ProtocolError(format!(
                "stream {} opened twice",
                id
            )));
        }

        let stream = MuxStream::spawn(self.clone(), id);
        if let Err(err) = accept_tx.try_send(stream) {
            warn!("Accept backlog full, resetting stream {}", id);
            self.reset_stream(id);
            drop(err);
            self.send(Frame::rst(id)).await?;
            return Ok(());
        }

        debug!("Registered incoming stream: {}", id);
        Ok(())
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, MuxCodec>,
    mut frames: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        // Queued frames (go-away in particular) still go out after shutdown.
        let frame = tokio::select! {
            biased;
            frame = frames.recv() => frame,
            _ = shared.shutdown.cancelled() => None,
        };

        let Some(frame) = frame else { break };

        if let Err(e) = sink.send(frame).await {
            shared.fail(e);
            break;
        }
    }

    let _ = sink.close().await;
    trace!("Write loop ended");
}

async fn read_loop<R>(
    mut frames: FramedRead<R, MuxCodec>,
    shared: Arc<Shared>,
    accept_tx: mpsc::Sender<MuxStream>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            None => {
                debug!("Physical connection closed by peer");
                break;
            }
            Some(Err(MuxError::Io(e))) if is_disconnect(&e) => {
                debug!("Physical connection dropped: {}", e);
                break;
            }
            Some(Err(e)) => {
                shared.fail(e);
                break;
            }
            Some(Ok(frame)) => match shared.handle_frame(frame, &accept_tx).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    shared.fail(e);
                    break;
                }
            },
        }
    }

    shared.shutdown.cancel();
    shared.close_streams();
    debug!("Receive loop ended");
}

async fn keep_alive_loop(shared: Arc<Shared>) {
    let interval = shared.config.keep_alive_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match tokio::time::timeout(shared.config.keep_alive_timeout, shared.ping()).await {
            Ok(Ok(rtt)) => trace!(rtt_ms = rtt.as_millis() as u64, "Keep-alive acknowledged"),
            Ok(Err(_)) => break,
            Err(_) => {
                shared.fail(MuxError::KeepAliveTimeout);
                break;
            }
        }
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
