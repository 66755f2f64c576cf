//! Control-plane plumbing for the Horizon fabric
//!
//! - [`rpc`]: request/response calls carried on multiplexed streams
//! - [`pool`]: pooled outbound connections keyed by target address
//! - [`broadcast`]: fan-out of registration updates to every hub
//! - [`client`] / [`server`]: the hub-to-control `AddService`/`RemoveService` calls

pub mod broadcast;
pub mod catalog;
pub mod client;
pub mod compression;
pub mod error;
pub mod multierror;
pub mod pool;
pub mod rpc;
pub mod server;
pub mod tls;

pub use broadcast::{BroadcastError, Broadcaster};
pub use catalog::{HubCatalog, SharedCatalog, StaticCatalog};
pub use client::RpcControlClient;
pub use error::{ControlError, Result, RpcError};
pub use multierror::MultiError;
pub use pool::{ConnectionPool, Connector, HubDialer, PooledClient, TlsConnector};
pub use rpc::{RpcCall, RpcChannel, RpcHandler, Status};
pub use server::ControlServer;

use async_trait::async_trait;
use hzn_proto::{AccountServices, LabelLinks, Noop, ServiceRequest};

/// RPC method names
pub mod methods {
    /// Hub to control: register one service
    pub const ADD_SERVICE: &str = "AddService";
    /// Hub to control: deregister one service
    pub const REMOVE_SERVICE: &str = "RemoveService";
    /// Control to hub: the full service list of an account
    pub const ADD_SERVICES: &str = "AddServices";
    /// Control to hub: label link updates
    pub const ADD_LABEL_LINKS: &str = "AddLabelLinks";
}

/// The control plane as seen by a hub
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn add_service(&self, request: &ServiceRequest) -> Result<()>;

    async fn remove_service(&self, request: &ServiceRequest) -> Result<()>;
}

/// The calls the control plane makes on a hub
#[async_trait]
pub trait HubServicesClient: Send + Sync {
    async fn add_services(&self, update: &AccountServices) -> Result<Noop>;

    async fn add_label_links(&self, links: &LabelLinks) -> Result<Noop>;
}
