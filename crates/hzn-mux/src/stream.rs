//! Logical streams carried by a session

use crate::frame::{Frame, StreamId};
use crate::session::Shared;
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Notify};
use tracing::trace;

/// Largest chunk read from a stream before it is framed
const READ_CHUNK: usize = 32 * 1024;

/// Flow-control state of one stream
///
/// `send` is the credit the peer has granted us; `recv` is what we have
/// granted the peer and not yet seen used. Inbound data beyond `recv` is a
/// protocol violation and resets the stream.
#[derive(Debug)]
pub(crate) struct Window {
    send: AtomicU32,
    send_ready: Notify,
    recv: AtomicU32,
    reset: AtomicBool,
}

impl Window {
    pub(crate) fn new(initial: u32) -> Self {
        Self {
            send: AtomicU32::new(initial),
            send_ready: Notify::new(),
            recv: AtomicU32::new(initial),
            reset: AtomicBool::new(false),
        }
    }

    /// Wait for send credit and take up to `want` bytes of it
    ///
    /// Returns `None` once the stream has been reset. Only the stream's
    /// forwarding task takes credit.
    async fn reserve(&self, want: u32) -> Option<u32> {
        loop {
            if self.reset.load(Ordering::Acquire) {
                return None;
            }

            let available = self.send.load(Ordering::Acquire);
            if available > 0 {
                let taken = available.min(want);
                self.send.fetch_sub(taken, Ordering::AcqRel);
                return Some(taken);
            }

            self.send_ready.notified().await;
        }
    }

    /// Peer granted `delta` more bytes
    pub(crate) fn grant(&self, delta: u32) {
        let _ = self
            .send
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |send| {
                Some(send.saturating_add(delta))
            });
        self.send_ready.notify_one();
    }

    /// Account for `len` inbound bytes; `false` if the peer overran its window
    pub(crate) fn consume_recv(&self, len: u32) -> bool {
        self.recv
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |recv| recv.checked_sub(len))
            .is_ok()
    }

    fn credit_recv(&self, len: u32) {
        self.recv.fetch_add(len, Ordering::AcqRel);
    }

    pub(crate) fn reset(&self) {
        self.reset.store(true, Ordering::Release);
        self.send_ready.notify_one();
    }
}

/// One logical, bidirectional byte stream inside a [`Session`](crate::Session)
///
/// Shutting down the write side sends FIN; the peer can keep writing.
/// Dropping the stream closes both directions. Writes block once the
/// peer's receive window is used up and it has not read the data yet.
#[derive(Debug)]
pub struct MuxStream {
    id: StreamId,
    io: DuplexStream,
}

impl MuxStream {
    /// Register stream `id` with the session and start moving its bytes
    pub(crate) fn spawn(shared: Arc<Shared>, id: StreamId) -> Self {
        let (user_side, session_side) = tokio::io::duplex(shared.config.stream_buffer_size);
        // Bounded by the receive window: the read loop resets a stream
        // whose peer sends past it.
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let window = Arc::new(Window::new(shared.config.stream_window));

        shared.register_stream(id, inbound_tx, window.clone());
        tokio::spawn(pump(shared, id, session_side, inbound_rx, window));

        Self { id, io: user_side }
    }

    pub fn stream_id(&self) -> StreamId {
        self.id
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Move bytes between the session and the user's half of the stream
async fn pump(
    shared: Arc<Shared>,
    id: StreamId,
    io: DuplexStream,
    mut inbound: mpsc::UnboundedReceiver<Bytes>,
    window: Arc<Window>,
) {
    let (mut reader, mut writer) = tokio::io::split(io);
    let update_threshold = (shared.config.stream_window / 2).max(1);

    let deliver = async {
        let mut consumed: u32 = 0;
        while let Some(data) = inbound.recv().await {
            // Blocks while the user isn't reading; the window stays used up.
            if writer.write_all(&data).await.is_err() {
                break;
            }

            consumed = consumed.saturating_add(data.len() as u32);
            if consumed >= update_threshold {
                window.credit_recv(consumed);
                if shared.send(Frame::window_update(id, consumed)).await.is_err() {
                    break;
                }
                consumed = 0;
            }
        }
        let _ = writer.shutdown().await;
    };

    let forward = async {
        let mut buf = vec![0u8; READ_CHUNK.min(shared.config.max_frame_size).max(1)];
        loop {
            let read = tokio::select! {
                _ = shared.shutdown.cancelled() => return,
                read = reader.read(&mut buf) => read,
            };

            let n = match read {
                Ok(0) => {
                    let _ = shared.send(Frame::fin(id)).await;
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    trace!("Stream {} read failed: {}", id, e);
                    let _ = shared.send(Frame::rst(id)).await;
                    return;
                }
            };

            let mut sent = 0;
            while sent < n {
                let credit = tokio::select! {
                    _ = shared.shutdown.cancelled() => return,
                    credit = window.reserve((n - sent) as u32) => credit,
                };
                let Some(credit) = credit else {
                    trace!("Stream {} reset, dropping unsent data", id);
                    return;
                };

                let end = sent + credit as usize;
                let frame = Frame::data(id, Bytes::copy_from_slice(&buf[sent..end]));
                if shared.send(frame).await.is_err() {
                    return;
                }
                sent = end;
            }
        }
    };

    tokio::join!(deliver, forward);
    shared.stream_finished(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reserve_waits_for_grant() {
        let window = Arc::new(Window::new(10));

        assert_eq!(window.reserve(4).await, Some(4));
        assert_eq!(window.reserve(100).await, Some(6));

        let waiting = tokio::spawn({
            let window = window.clone();
            async move { window.reserve(8).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        window.grant(5);
        assert_eq!(waiting.await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_reset_wakes_reserve() {
        let window = Arc::new(Window::new(0));
        let waiting = tokio::spawn({
            let window = window.clone();
            async move { window.reserve(1).await }
        });

        window.reset();
        assert_eq!(waiting.await.unwrap(), None);
    }

    #[test]
    fn test_recv_window_overrun() {
        let window = Window::new(10);

        assert!(window.consume_recv(6));
        assert!(!window.consume_recv(5));
        assert!(window.consume_recv(4));

        window.credit_recv(3);
        assert!(window.consume_recv(3));
        assert!(!window.consume_recv(1));
    }
}
