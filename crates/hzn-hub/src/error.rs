//! Hub error types

use hzn_auth::TokenError;
use hzn_control::ControlError;
use hzn_mux::MuxError;
use hzn_proto::{CodecError, ServiceId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Codec(#[from] CodecError),

    #[error("Session error: {0}")]
    Mux(#[from] MuxError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid token: {0}")]
    InvalidToken(#[from] TokenError),

    #[error("Token lacks capability {0}")]
    MissingCapability(&'static str),

    #[error("Failed to register service {service_id}: {source}")]
    Registration {
        service_id: ServiceId,
        #[source]
        source: ControlError,
    },

    #[error("Control plane error: {0}")]
    Control(#[from] ControlError),
}

pub type Result<T> = std::result::Result<T, HubError>;
