//! Fans registration updates out to every hub

use crate::catalog::HubCatalog;
use crate::error::ControlError;
use crate::multierror::MultiError;
use crate::pool::HubDialer;
use crate::HubServicesClient;
use hzn_proto::{AccountServices, LabelLinks};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// One hub that did not take an update
#[derive(Debug, Error)]
#[error("{target}: {source}")]
pub struct BroadcastError {
    pub target: String,
    #[source]
    pub source: ControlError,
}

pub type BroadcastResult = std::result::Result<(), MultiError<BroadcastError>>;

/// Sends each update to every hub listed by the catalog
///
/// Every target is attempted even when earlier ones fail; the failures come
/// back together once all targets have been tried.
pub struct Broadcaster {
    catalog: Arc<dyn HubCatalog>,
    dialer: Arc<dyn HubDialer>,
}

impl Broadcaster {
    pub fn new(catalog: Arc<dyn HubCatalog>, dialer: Arc<dyn HubDialer>) -> Self {
        Self { catalog, dialer }
    }

    pub async fn advertise_services(&self, update: &AccountServices) -> BroadcastResult {
        self.fan_out(Update::Services(update)).await
    }

    pub async fn advertise_label_links(&self, links: &LabelLinks) -> BroadcastResult {
        self.fan_out(Update::LabelLinks(links)).await
    }

    async fn fan_out(&self, update: Update<'_>) -> BroadcastResult {
        let targets = self.catalog.targets().await;
        let mut errors = MultiError::new();

        info!(targets = targets.len(), "Hub broadcast of {} beginning", update.describe());

        for target in targets {
            info!(hub = %target, "Broadcasting hub update");

            let result = match self.dialer.dial_hub(&target).await {
                Ok(client) => update.send(client.as_ref()).await,
                Err(e) => Err(e),
            };

            if let Err(source) = result {
                warn!(hub = %target, "Hub update failed: {}", source);
                errors.push(BroadcastError { target, source });
            }
        }

        errors.into_result()
    }
}

enum Update<'a> {
    Services(&'a AccountServices),
    LabelLinks(&'a LabelLinks),
}

impl Update<'_> {
    async fn send(&self, client: &dyn HubServicesClient) -> crate::Result<()> {
        match self {
            Update::Services(update) => client.add_services(update).await.map(|_| ()),
            Update::LabelLinks(links) => client.add_label_links(links).await.map(|_| ()),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Update::Services(_) => "services",
            Update::LabelLinks(_) => "label links",
        }
    }
}
