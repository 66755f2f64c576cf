//! Request/response calls over a multiplexed connection
//!
//! The caller owns the client side of a [`Session`]. Its first logical
//! stream carries the [`Hello`] exchange; every call after that opens a
//! fresh stream, writes one [`RpcRequest`] frame and reads one
//! [`RpcResponse`] frame back.

use crate::compression;
use crate::error::RpcError;
use async_trait::async_trait;
use hzn_auth::AuthError;
use hzn_mux::{MuxConfig, MuxStream, Session};
use hzn_proto::{
    Compression, FramingReader, FramingWriter, Hello, HelloAck, Metadata, RpcRequest,
    RpcResponse, RpcStatus, HELLO_TAG, RPC_TAG,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tracing::{debug, trace, warn};

type StreamReader = FramingReader<ReadHalf<MuxStream>>;
type StreamWriter = FramingWriter<WriteHalf<MuxStream>>;

fn framed(stream: MuxStream) -> (StreamReader, StreamWriter) {
    let (reader, writer) = tokio::io::split(stream);
    (FramingReader::new(reader), FramingWriter::new(writer))
}

/// How long a call may take, request to response, unless configured otherwise
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Client side of an RPC connection
pub struct RpcChannel {
    target: String,
    session: Session,
    compression: Compression,
    call_timeout: Duration,
}

impl RpcChannel {
    /// Start a session on `io` and negotiate compression with the server
    pub async fn handshake<T>(
        io: T,
        target: impl Into<String>,
        config: MuxConfig,
        offer: &[Compression],
    ) -> Result<Self, RpcError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let target = target.into();
        let session = Session::client(io, config);

        let (mut reader, mut writer) = framed(session.open_stream().await?);
        writer
            .write_marshal(
                HELLO_TAG,
                &Hello {
                    compression: offer.to_vec(),
                },
            )
            .await?;

        let (tag, _, ack): (u8, usize, HelloAck) = reader.read_marshal().await?;
        if tag != HELLO_TAG {
            return Err(RpcError::Protocol(format!(
                "expected hello ack, got tag {}",
                tag
            )));
        }
        if ack.compression != Compression::None && !offer.contains(&ack.compression) {
            return Err(RpcError::Protocol(format!(
                "server picked unoffered compression {}",
                ack.compression
            )));
        }

        debug!(peer = %target, compression = %ack.compression, "RPC channel established");

        Ok(Self {
            target,
            session,
            compression: ack.compression,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        })
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Make one call
    ///
    /// Fails with [`RpcError::Timeout`] if no response arrives within the
    /// channel's call timeout; the call's stream is dropped and reset.
    pub async fn call<Req, Resp>(
        &self,
        method: &str,
        metadata: Metadata,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        match tokio::time::timeout(self.call_timeout, self.exchange(method, metadata, request)).await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(peer = %self.target, method, "RPC call timed out");
                Err(RpcError::Timeout(format!(
                    "{} to {} after {:?}",
                    method, self.target, self.call_timeout
                )))
            }
        }
    }

    async fn exchange<Req, Resp>(
        &self,
        method: &str,
        metadata: Metadata,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let body = bincode::serialize(request).map_err(|e| RpcError::Encode(e.to_string()))?;
        let body = compression::compress(self.compression, &body)?;

        let (mut reader, mut writer) = framed(self.session.open_stream().await?);
        trace!(peer = %self.target, method, "Sending RPC request");

        writer
            .write_marshal(
                RPC_TAG,
                &RpcRequest {
                    method: method.to_string(),
                    metadata,
                    compression: self.compression,
                    body,
                },
            )
            .await?;
        writer.recycle();
        writer.shutdown().await?;

        let (tag, _, response): (u8, usize, RpcResponse) = reader.read_marshal().await?;
        reader.recycle();
        if tag != RPC_TAG {
            return Err(RpcError::Protocol(format!(
                "expected rpc response, got tag {}",
                tag
            )));
        }

        if response.status != RpcStatus::Ok {
            return Err(RpcError::Status {
                status: response.status,
                message: response.message,
            });
        }

        let body = compression::decompress(response.compression, &response.body)?;
        bincode::deserialize(&body).map_err(|e| RpcError::Decode(e.to_string()))
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// True once the underlying session has shut down
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    pub fn close(&self) {
        self.session.close();
    }
}

impl fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcChannel")
            .field("target", &self.target)
            .field("compression", &self.compression)
            .field("call_timeout", &self.call_timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Failure returned by an [`RpcHandler`]; sent back as the response status
#[derive(Debug, Error)]
#[error("{status}: {message}")]
pub struct Status {
    pub status: RpcStatus,
    pub message: String,
}

impl Status {
    pub fn new(status: RpcStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(RpcStatus::Unauthenticated, message)
    }

    pub fn unimplemented(method: &str) -> Self {
        Self::new(RpcStatus::Unimplemented, format!("unknown method {}", method))
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(RpcStatus::InvalidArgument, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RpcStatus::Internal, message)
    }
}

impl From<AuthError> for Status {
    fn from(err: AuthError) -> Self {
        Status::unauthenticated(err.to_string())
    }
}

/// One decoded inbound call
#[derive(Debug)]
pub struct RpcCall {
    pub method: String,
    pub metadata: Metadata,
    body: Vec<u8>,
}

impl RpcCall {
    pub fn new(method: impl Into<String>, metadata: Metadata, body: Vec<u8>) -> Self {
        Self {
            method: method.into(),
            metadata,
            body,
        }
    }

    /// Decode the request body
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Status> {
        bincode::deserialize(&self.body)
            .map_err(|e| Status::invalid_argument(format!("malformed {} request: {}", self.method, e)))
    }
}

/// Encode a handler's reply
pub fn reply<T: Serialize>(value: &T) -> Result<Vec<u8>, Status> {
    bincode::serialize(value).map_err(|e| Status::internal(e.to_string()))
}

/// Serves calls arriving on an RPC connection
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Handle one call, returning the encoded reply body
    async fn handle(&self, call: RpcCall) -> Result<Vec<u8>, Status>;
}

/// Serve RPC calls on an accepted connection until the peer goes away
pub async fn serve_connection<T>(
    io: T,
    handler: Arc<dyn RpcHandler>,
    config: MuxConfig,
) -> Result<(), RpcError>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let session = Session::server(io, config);

    let Some(first) = session.accept_stream().await? else {
        return Ok(());
    };
    let compression = answer_hello(first).await?;
    debug!(compression = %compression, "RPC connection negotiated");

    loop {
        match session.accept_stream().await {
            Ok(Some(stream)) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_call(stream, handler.as_ref(), compression).await {
                        debug!("RPC call failed: {}", e);
                    }
                });
            }
            Ok(None) => {
                debug!("RPC peer disconnected");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn answer_hello(stream: MuxStream) -> Result<Compression, RpcError> {
    let (mut reader, mut writer) = framed(stream);

    let (tag, _, hello): (u8, usize, Hello) = reader.read_marshal().await?;
    if tag != HELLO_TAG {
        return Err(RpcError::Protocol(format!("expected hello, got tag {}", tag)));
    }

    let compression = compression::negotiate(&hello.compression);
    writer
        .write_marshal(HELLO_TAG, &HelloAck { compression })
        .await?;
    writer.shutdown().await?;

    Ok(compression)
}

async fn serve_call(
    stream: MuxStream,
    handler: &dyn RpcHandler,
    compression: Compression,
) -> Result<(), RpcError> {
    let (mut reader, mut writer) = framed(stream);

    let (tag, _, request): (u8, usize, RpcRequest) = reader.read_marshal().await?;
    reader.recycle();

    let response = if tag != RPC_TAG {
        warn!("Unexpected frame tag {} on RPC stream", tag);
        RpcResponse::error(RpcStatus::InvalidArgument, "expected rpc request")
    } else {
        dispatch(request, handler, compression).await
    };

    writer.write_marshal(RPC_TAG, &response).await?;
    writer.recycle();
    writer.shutdown().await?;
    Ok(())
}

async fn dispatch(
    request: RpcRequest,
    handler: &dyn RpcHandler,
    compression: Compression,
) -> RpcResponse {
    let body = match compression::decompress(request.compression, &request.body) {
        Ok(body) => body,
        Err(e) => return RpcResponse::error(RpcStatus::InvalidArgument, e.to_string()),
    };

    let method = request.method.clone();
    let result = handler
        .handle(RpcCall::new(request.method, request.metadata, body))
        .await
        .and_then(|body| {
            compression::compress(compression, &body).map_err(|e| Status::internal(e.to_string()))
        });

    match result {
        Ok(body) => RpcResponse {
            status: RpcStatus::Ok,
            message: String::new(),
            compression,
            body,
        },
        Err(status) => {
            debug!(method = %method, "RPC call rejected: {}", status);
            RpcResponse::error(status.status, status.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle(&self, call: RpcCall) -> Result<Vec<u8>, Status> {
            match call.method.as_str() {
                "Echo" => {
                    let text: String = call.decode()?;
                    reply(&text.to_uppercase())
                }
                "Whoami" => reply(&call.metadata.get("authorization").map(str::to_string)),
                "Deny" => Err(Status::unauthenticated("bad control token")),
                "Hang" => std::future::pending().await,
                other => Err(Status::unimplemented(other)),
            }
        }
    }

    async fn connected(offer: &[Compression]) -> RpcChannel {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_connection(server_io, Arc::new(Echo), MuxConfig::default()));

        RpcChannel::handshake(client_io, "in-memory", MuxConfig::default(), offer)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_call_roundtrip_with_deflate() {
        let channel = connected(&[Compression::Deflate]).await;
        assert_eq!(channel.compression(), Compression::Deflate);

        let reply: String = channel
            .call("Echo", Metadata::new(), &"hello hub".to_string())
            .await
            .unwrap();
        assert_eq!(reply, "HELLO HUB");
    }

    #[tokio::test]
    async fn test_metadata_reaches_handler() {
        let channel = connected(&[Compression::None]).await;

        let seen: Option<String> = channel
            .call(
                "Whoami",
                Metadata::new().with("authorization", "token-1"),
                &(),
            )
            .await
            .unwrap();
        assert_eq!(seen.as_deref(), Some("token-1"));
    }

    #[tokio::test]
    async fn test_error_status_is_returned() {
        let channel = connected(&[Compression::Deflate]).await;

        let err = channel
            .call::<_, ()>("Deny", Metadata::new(), &())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(RpcStatus::Unauthenticated));

        let err = channel
            .call::<_, ()>("Nope", Metadata::new(), &())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(RpcStatus::Unimplemented));
    }

    #[tokio::test]
    async fn test_unanswered_call_times_out() {
        let channel = connected(&[Compression::None])
            .await
            .with_call_timeout(Duration::from_millis(100));

        let err = channel
            .call::<_, ()>("Hang", Metadata::new(), &())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout(_)));

        // The channel stays usable for later calls.
        let reply: String = channel
            .call("Echo", Metadata::new(), &"still here".to_string())
            .await
            .unwrap();
        assert_eq!(reply, "STILL HERE");
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_one_channel() {
        let channel = Arc::new(connected(&[Compression::Deflate]).await);

        let mut calls = Vec::new();
        for i in 0..10 {
            let channel = channel.clone();
            calls.push(tokio::spawn(async move {
                let reply: String = channel
                    .call("Echo", Metadata::new(), &format!("call-{i}"))
                    .await
                    .unwrap();
                assert_eq!(reply, format!("CALL-{i}"));
            }));
        }
        for call in calls {
            call.await.unwrap();
        }
    }
}
