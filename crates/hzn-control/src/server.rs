//! In-memory control plane
//!
//! Keeps the service-of-record for every account in memory and, after each
//! change, pushes the account's full service list to all hubs.

use crate::broadcast::Broadcaster;
use crate::methods;
use crate::rpc::{reply, RpcCall, RpcHandler, Status};
use async_trait::async_trait;
use hzn_auth::{require_role, Role, TokenValidator};
use hzn_proto::{Account, AccountServices, LabelLinks, Noop, ServiceId, ServiceRequest, ServiceRoute};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

pub struct ControlServer {
    validator: TokenValidator,
    broadcaster: Arc<Broadcaster>,
    services: RwLock<HashMap<Account, BTreeMap<ServiceId, ServiceRoute>>>,
}

impl ControlServer {
    pub fn new(validator: TokenValidator, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            validator,
            broadcaster,
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Record that `request.id` is reachable through `request.hub`
    pub async fn add_service(&self, request: &ServiceRequest) {
        let snapshot = {
            let mut services = self.services.write().await;
            let routes = services.entry(request.account.clone()).or_default();
            routes.insert(request.id, ServiceRoute::from(request));
            snapshot(&request.account, routes)
        };

        info!(
            account = %request.account,
            service_id = %request.id,
            hub = %request.hub,
            "Service added"
        );
        self.publish(&snapshot).await;
    }

    /// Forget `request.id`, if it is still routed through `request.hub`
    pub async fn remove_service(&self, request: &ServiceRequest) {
        let snapshot = {
            let mut services = self.services.write().await;
            let Some(routes) = services.get_mut(&request.account) else {
                return;
            };

            if !routes
                .get(&request.id)
                .is_some_and(|route| route.hub == request.hub)
            {
                return;
            }
            routes.remove(&request.id);

            let snapshot = snapshot(&request.account, routes);
            if routes.is_empty() {
                services.remove(&request.account);
            }
            snapshot
        };

        info!(
            account = %request.account,
            service_id = %request.id,
            hub = %request.hub,
            "Service removed"
        );
        self.publish(&snapshot).await;
    }

    /// Push label link changes to every hub
    pub async fn add_label_links(&self, links: &LabelLinks) {
        if let Err(errs) = self.broadcaster.advertise_label_links(links).await {
            error!("Error broadcasting label links: {}", errs);
        }
    }

    /// Current routes of `account`
    pub async fn services(&self, account: &Account) -> Vec<ServiceRoute> {
        self.services
            .read()
            .await
            .get(account)
            .map(|routes| routes.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn publish(&self, update: &AccountServices) {
        if let Err(errs) = self.broadcaster.advertise_services(update).await {
            error!(account = %update.account, "Error broadcasting services: {}", errs);
        }
    }
}

fn snapshot(account: &Account, routes: &BTreeMap<ServiceId, ServiceRoute>) -> AccountServices {
    AccountServices {
        account: account.clone(),
        services: routes.values().cloned().collect(),
    }
}

#[async_trait]
impl RpcHandler for ControlServer {
    async fn handle(&self, call: RpcCall) -> Result<Vec<u8>, Status> {
        match call.method.as_str() {
            methods::ADD_SERVICE => {
                require_role(&call.metadata, &self.validator, Role::Hub)?;
                let request: ServiceRequest = call.decode()?;
                self.add_service(&request).await;
                reply(&Noop)
            }
            methods::REMOVE_SERVICE => {
                require_role(&call.metadata, &self.validator, Role::Hub)?;
                let request: ServiceRequest = call.decode()?;
                self.remove_service(&request).await;
                reply(&Noop)
            }
            other => Err(Status::unimplemented(other)),
        }
    }
}
