//! Calls the control plane makes on a hub

use crate::recent::RecentCatalog;
use async_trait::async_trait;
use hzn_auth::{require_role, Role, TokenValidator};
use hzn_control::methods;
use hzn_control::rpc::{reply, RpcCall, RpcHandler, Status};
use hzn_proto::{AccountServices, LabelLinks, Noop};
use std::sync::Arc;

/// Serves `AddServices` and `AddLabelLinks`
///
/// Both require a token with the CONTROL role; anything else is rejected
/// before the catalog is touched.
pub struct InboundServer {
    validator: TokenValidator,
    catalog: Arc<RecentCatalog>,
}

impl InboundServer {
    pub fn new(validator: TokenValidator, catalog: Arc<RecentCatalog>) -> Self {
        Self { validator, catalog }
    }

    pub fn catalog(&self) -> &Arc<RecentCatalog> {
        &self.catalog
    }
}

#[async_trait]
impl RpcHandler for InboundServer {
    async fn handle(&self, call: RpcCall) -> Result<Vec<u8>, Status> {
        match call.method.as_str() {
            methods::ADD_SERVICES => {
                require_role(&call.metadata, &self.validator, Role::Control)?;
                let update: AccountServices = call.decode()?;
                self.catalog.add_recent_account_services(update).await;
                reply(&Noop)
            }
            methods::ADD_LABEL_LINKS => {
                require_role(&call.metadata, &self.validator, Role::Control)?;
                let links: LabelLinks = call.decode()?;
                self.catalog.add_recent_label_links(links).await;
                reply(&Noop)
            }
            other => Err(Status::unimplemented(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use hzn_auth::{TokenClaims, TokenCreator, AUTHORIZATION};
    use hzn_proto::{Account, Metadata, RpcStatus};

    fn server() -> (InboundServer, TokenCreator) {
        let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519).unwrap();
        let server = InboundServer::new(
            TokenValidator::from_ed_der(key_pair.public_key_raw()),
            Arc::new(RecentCatalog::new()),
        );
        (server, TokenCreator::from_ed_der(&key_pair.serialize_der()))
    }

    fn call(method: &str, creator: Option<(&TokenCreator, Role)>, update: &AccountServices) -> RpcCall {
        let mut metadata = Metadata::new();
        if let Some((creator, role)) = creator {
            let token = creator
                .create(&TokenClaims::new(
                    Account::new("/control", "control"),
                    role,
                    Duration::hours(1),
                ))
                .unwrap();
            metadata.insert(AUTHORIZATION, token);
        }
        RpcCall::new(method, metadata, reply(update).unwrap())
    }

    fn update() -> AccountServices {
        AccountServices {
            account: Account::new("/test", "acct-1"),
            services: vec![],
        }
    }

    #[tokio::test]
    async fn test_control_role_updates_catalog() {
        let (server, creator) = server();

        server
            .handle(call(methods::ADD_SERVICES, Some((&creator, Role::Control)), &update()))
            .await
            .unwrap();

        assert!(server
            .catalog()
            .account_services(&update().account)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_other_roles_are_rejected_before_mutation() {
        let (server, creator) = server();

        for role in [Role::Agent, Role::Hub, Role::Manage] {
            let err = server
                .handle(call(methods::ADD_SERVICES, Some((&creator, role)), &update()))
                .await
                .unwrap_err();
            assert_eq!(err.status, RpcStatus::Unauthenticated);
        }

        let err = server
            .handle(call(methods::ADD_SERVICES, None, &update()))
            .await
            .unwrap_err();
        assert_eq!(err.status, RpcStatus::Unauthenticated);

        assert!(server
            .catalog()
            .account_services(&update().account)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (server, creator) = server();

        let err = server
            .handle(call("Bogus", Some((&creator, Role::Control)), &update()))
            .await
            .unwrap_err();
        assert_eq!(err.status, RpcStatus::Unimplemented);
    }
}
