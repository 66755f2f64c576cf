//! Session configuration

use std::time::Duration;

/// Default interval between keep-alive pings
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Bytes a peer may send on a stream before it has to wait for a window update
pub const DEFAULT_STREAM_WINDOW: u32 = 256 * 1024;

/// Multiplexer session configuration
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Send periodic pings on the physical connection
    pub enable_keep_alive: bool,

    /// Time between keep-alive pings
    pub keep_alive_interval: Duration,

    /// How long to wait for a ping reply before the session is closed
    pub keep_alive_timeout: Duration,

    /// Inbound streams queued before the accept loop picks them up;
    /// further streams are reset
    pub accept_backlog: usize,

    /// Largest payload carried by one frame
    pub max_frame_size: usize,

    /// Per-stream buffer between the session and the stream's reader/writer
    pub stream_buffer_size: usize,

    /// Initial receive window of every stream; both peers must agree on it
    pub stream_window: u32,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            enable_keep_alive: true,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            keep_alive_timeout: Duration::from_secs(10),
            accept_backlog: 256,
            max_frame_size: 256 * 1024,
            stream_buffer_size: 64 * 1024,
            stream_window: DEFAULT_STREAM_WINDOW,
        }
    }
}

impl MuxConfig {
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.enable_keep_alive = true;
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    pub fn without_keep_alive(mut self) -> Self {
        self.enable_keep_alive = false;
        self
    }

    pub fn with_accept_backlog(mut self, backlog: usize) -> Self {
        self.accept_backlog = backlog;
        self
    }

    pub fn with_stream_window(mut self, window: u32) -> Self {
        self.stream_window = window.max(1);
        self
    }
}
