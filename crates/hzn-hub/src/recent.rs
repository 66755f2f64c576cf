//! What the control plane last told this hub

use hzn_proto::{Account, AccountServices, LabelLink, LabelLinks, LabelSet};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Latest service lists and label links pushed by the control plane
#[derive(Debug, Default)]
pub struct RecentCatalog {
    services: RwLock<HashMap<Account, AccountServices>>,
    label_links: RwLock<HashMap<Account, Vec<LabelLink>>>,
}

impl RecentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the known services of `update.account`
    pub async fn add_recent_account_services(&self, update: AccountServices) {
        debug!(
            account = %update.account,
            services = update.services.len(),
            "Updating account services"
        );
        self.services
            .write()
            .await
            .insert(update.account.clone(), update);
    }

    /// Merge `links` in, replacing any existing link with the same labels
    pub async fn add_recent_label_links(&self, links: LabelLinks) {
        let mut known = self.label_links.write().await;

        for link in links.label_links {
            let account_links = known.entry(link.account.clone()).or_default();
            account_links.retain(|existing| existing.labels != link.labels);
            account_links.push(link);
        }
    }

    pub async fn account_services(&self, account: &Account) -> Option<AccountServices> {
        self.services.read().await.get(account).cloned()
    }

    /// Target of the label link on `account` matching `labels`, if any
    pub async fn resolve_label_link(&self, account: &Account, labels: &LabelSet) -> Option<LabelSet> {
        self.label_links
            .read()
            .await
            .get(account)?
            .iter()
            .find_map(|link| link.resolve(labels).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hzn_proto::{label_set, HubId, ServiceId, ServiceRoute};

    fn account() -> Account {
        Account::new("/test", "acct-1")
    }

    #[tokio::test]
    async fn test_latest_services_win() {
        let catalog = RecentCatalog::new();
        let route = ServiceRoute {
            hub: HubId::new(),
            id: ServiceId::new(),
            service_type: "http".to_string(),
            labels: label_set(&[("env", "prod")]),
        };

        catalog
            .add_recent_account_services(AccountServices {
                account: account(),
                services: vec![route.clone()],
            })
            .await;
        catalog
            .add_recent_account_services(AccountServices {
                account: account(),
                services: vec![],
            })
            .await;

        let known = catalog.account_services(&account()).await.unwrap();
        assert!(known.services.is_empty());
        assert!(catalog
            .account_services(&Account::new("/test", "other"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_label_links_replace_by_labels() {
        let catalog = RecentCatalog::new();
        let labels = label_set(&[("app", "web")]);

        catalog
            .add_recent_label_links(LabelLinks {
                label_links: vec![LabelLink::new(
                    account(),
                    labels.clone(),
                    label_set(&[("app", "web"), ("env", "staging")]),
                )],
            })
            .await;
        catalog
            .add_recent_label_links(LabelLinks {
                label_links: vec![LabelLink::new(
                    account(),
                    labels.clone(),
                    label_set(&[("app", "web"), ("env", "prod")]),
                )],
            })
            .await;

        assert_eq!(
            catalog.resolve_label_link(&account(), &labels).await,
            Some(label_set(&[("app", "web"), ("env", "prod")]))
        );
        assert_eq!(
            catalog
                .resolve_label_link(&account(), &label_set(&[("app", "db")]))
                .await,
            None
        );
    }
}
