//! Envelope for control-plane RPC calls carried on multiplexed streams
//!
//! Each call occupies one logical stream: the caller writes one
//! [`RpcRequest`] frame and the callee answers with one [`RpcResponse`].
//! The first stream of a connection carries a [`Hello`] exchange that fixes
//! the payload compression for the rest of the connection.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Payload compression applied to RPC bodies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    #[default]
    None,
    Deflate,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => f.write_str("none"),
            Compression::Deflate => f.write_str("deflate"),
        }
    }
}

/// Client's offer, in order of preference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub compression: Vec<Compression>,
}

/// Server's pick out of the offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck {
    pub compression: Compression,
}

/// Call metadata, keyed by lowercase name; a key can carry several values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata(BTreeMap<String, Vec<String>>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0
            .entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.0
            .get(&key.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First value stored under `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub metadata: Metadata,
    pub compression: Compression,
    pub body: Vec<u8>,
}

/// Outcome class of an RPC call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcStatus {
    Ok,
    Unauthenticated,
    Unimplemented,
    InvalidArgument,
    Internal,
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RpcStatus::Ok => "ok",
            RpcStatus::Unauthenticated => "unauthenticated",
            RpcStatus::Unimplemented => "unimplemented",
            RpcStatus::InvalidArgument => "invalid argument",
            RpcStatus::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub status: RpcStatus,
    pub message: String,
    pub compression: Compression,
    pub body: Vec<u8>,
}

impl RpcResponse {
    pub fn error(status: RpcStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            compression: Compression::None,
            body: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_is_case_insensitive() {
        let md = Metadata::new().with("Authorization", "token-a");

        assert_eq!(md.get("authorization"), Some("token-a"));
        assert_eq!(md.get_all("AUTHORIZATION").len(), 1);
    }

    #[test]
    fn test_metadata_multiple_values_keep_order() {
        let md = Metadata::new()
            .with("authorization", "first")
            .with("authorization", "second");

        assert_eq!(md.get("authorization"), Some("first"));
        assert_eq!(md.get_all("authorization"), ["first", "second"]);
        assert!(md.get_all("missing").is_empty());
    }
}
