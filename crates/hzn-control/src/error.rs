//! Control-plane error types

use hzn_auth::{AuthError, TokenError};
use hzn_mux::MuxError;
use hzn_proto::{CodecError, RpcStatus};
use thiserror::Error;

/// Errors from the RPC transport
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Codec(#[from] CodecError),

    #[error("Session error: {0}")]
    Mux(#[from] MuxError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// The remote side answered with a non-ok status
    #[error("{status}: {message}")]
    Status { status: RpcStatus, message: String },
}

impl RpcError {
    /// Status reported by the remote side, if the call got that far
    pub fn status(&self) -> Option<RpcStatus> {
        match self {
            RpcError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Control-plane errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("RPC failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("Authorization failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ControlError>;
