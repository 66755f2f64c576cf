//! Horizon Protocol Definitions
//!
//! This crate defines the wire messages exchanged between agents, hubs and the
//! control plane, and the length-prefixed frame codec used to carry them.

pub mod codec;
pub mod labels;
pub mod messages;
pub mod pool;
pub mod rpc;

pub use codec::{CodecError, FramingReader, FramingWriter};
pub use labels::{Label, LabelSet};
pub use messages::*;
pub use pool::{BufferPool, PooledBuf};
pub use rpc::{Compression, Hello, HelloAck, Metadata, RpcRequest, RpcResponse, RpcStatus};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Tag of the first frame written by a connecting agent
pub const PREAMBLE_TAG: u8 = 1;

/// Tag of the hub's reply to a preamble
pub const CONFIRMATION_TAG: u8 = 1;

/// Tag of the compression negotiation frames on an RPC connection
pub const HELLO_TAG: u8 = 2;

/// Tag of an RPC request or response frame
pub const RPC_TAG: u8 = 3;

/// ALPN protocol used by agents opening a tunnel session
pub const ALPN_TUNNEL: &[u8] = b"hzn";

/// ALPN protocol used for control-plane RPC connections
pub const ALPN_RPC: &[u8] = b"hzn-rpc";

/// Capability a token must carry to advertise services
pub const SERVE_CAPABILITY: &str = "hzn:serve";
