//! Hub-side client of the control plane

use crate::error::Result;
use crate::methods;
use crate::pool::ConnectionPool;
use crate::ControlPlane;
use async_trait::async_trait;
use hzn_proto::{HubId, Noop, ServiceRequest};
use std::sync::Arc;
use tracing::debug;

/// Makes the hub's `AddService`/`RemoveService` calls over a pooled
/// connection to the control plane
#[derive(Debug, Clone)]
pub struct RpcControlClient {
    pool: Arc<ConnectionPool>,
    control_addr: String,
    hub_id: HubId,
}

impl RpcControlClient {
    /// `pool` should carry the hub's own token.
    pub fn new(pool: Arc<ConnectionPool>, control_addr: impl Into<String>, hub_id: HubId) -> Self {
        Self {
            pool,
            control_addr: control_addr.into(),
            hub_id,
        }
    }

    pub fn hub_id(&self) -> HubId {
        self.hub_id
    }
}

#[async_trait]
impl ControlPlane for RpcControlClient {
    async fn add_service(&self, request: &ServiceRequest) -> Result<()> {
        debug!(service_id = %request.id, "Registering service with control");
        let client = self.pool.dial(&self.control_addr).await?;
        let _: Noop = client.call(methods::ADD_SERVICE, request).await?;
        Ok(())
    }

    async fn remove_service(&self, request: &ServiceRequest) -> Result<()> {
        debug!(service_id = %request.id, "Removing service from control");
        let client = self.pool.dial(&self.control_addr).await?;
        let _: Noop = client.call(methods::REMOVE_SERVICE, request).await?;
        Ok(())
    }
}
