//! Per-stream dispatch

use async_trait::async_trait;
use hzn_auth::ValidToken;
use hzn_mux::{MuxStream, StreamId};
use hzn_proto::{CodecError, FramingReader, FramingWriter};
use tokio::io::{ReadHalf, WriteHalf};
use tracing::{debug, trace};

/// Everything a handler gets for one accepted logical stream
pub struct StreamContext {
    pub stream_id: StreamId,
    /// Token the owning agent authenticated with
    pub token: ValidToken,
    pub reader: FramingReader<ReadHalf<MuxStream>>,
    pub writer: FramingWriter<WriteHalf<MuxStream>>,
}

impl StreamContext {
    pub fn new(stream: MuxStream, token: ValidToken) -> Self {
        let stream_id = stream.stream_id();
        let (reader, writer) = tokio::io::split(stream);

        Self {
            stream_id,
            token,
            reader: FramingReader::new(reader),
            writer: FramingWriter::new(writer),
        }
    }

    pub fn account_id(&self) -> &str {
        self.token.account_id()
    }

    /// Hand both frame buffers back to the pool
    pub fn recycle(&mut self) {
        self.reader.recycle();
        self.writer.recycle();
    }
}

/// Serves logical streams accepted on agent sessions
///
/// Each call runs on its own task; a slow handler only holds up its own stream.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle_stream(&self, ctx: StreamContext);
}

/// Reads and discards frames, logging each one
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

#[async_trait]
impl StreamHandler for LogHandler {
    async fn handle_stream(&self, mut ctx: StreamContext) {
        loop {
            match ctx.reader.read_frame().await {
                Ok((tag, body)) => trace!(
                    stream_id = ctx.stream_id,
                    account_id = ctx.token.account_id(),
                    tag,
                    size = body.len(),
                    "Frame received"
                ),
                Err(CodecError::Closed) => break,
                Err(e) => {
                    debug!(stream_id = ctx.stream_id, "Stream read failed: {}", e);
                    break;
                }
            }
        }
        ctx.recycle();
    }
}
