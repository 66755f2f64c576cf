//! Protocol message types

use crate::labels::{Label, LabelSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Wall-clock timestamp carried on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub sec: u64,
    pub nsec: u64,
}

impl Timestamp {
    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Self {
            sec: now.timestamp().max(0) as u64,
            nsec: u64::from(now.timestamp_subsec_nanos()),
        }
    }
}

/// Identifier of an advertised service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(pub Uuid);

impl ServiceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Canonical string form, used as the key of the active-session map
    pub fn map_key(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a hub process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HubId(pub Uuid);

impl HubId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HubId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owning account of a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Account {
    pub namespace: String,
    pub account_id: String,
}

impl Account {
    pub fn new(namespace: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            account_id: account_id.into(),
        }
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.account_id)
    }
}

/// A service advertised by an agent in its preamble
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_id: ServiceId,
    pub service_type: String,
    pub labels: LabelSet,
    pub metadata: BTreeMap<String, String>,
}

impl ServiceInfo {
    pub fn new(service_type: impl Into<String>, labels: LabelSet) -> Self {
        Self {
            service_id: ServiceId::new(),
            service_type: service_type.into(),
            labels,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// First frame written by a connecting agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preamble {
    pub token: String,
    pub session_id: Vec<u8>,
    pub services: Vec<ServiceInfo>,
}

/// Hub's answer to a [`Preamble`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub status: String,
    pub time: Timestamp,
}

impl Confirmation {
    pub const CONNECTED: &'static str = "connected";
    pub const BAD_TOKEN: &'static str = "bad-token";
    pub const BAD_TOKEN_CAPABILITY: &'static str = "bad-token-capability";

    pub fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
            time: Timestamp::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == Self::CONNECTED
    }
}

/// Hub to control plane: a service became reachable (or went away)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub account: Account,
    pub hub: HubId,
    pub id: ServiceId,
    pub service_type: String,
    pub labels: LabelSet,
    pub metadata: BTreeMap<String, String>,
}

impl ServiceRequest {
    pub fn new(account: Account, hub: HubId, service: &ServiceInfo) -> Self {
        Self {
            account,
            hub,
            id: service.service_id,
            service_type: service.service_type.clone(),
            labels: service.labels.clone(),
            metadata: service.metadata.clone(),
        }
    }
}

/// Where a single service can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRoute {
    pub hub: HubId,
    pub id: ServiceId,
    pub service_type: String,
    pub labels: LabelSet,
}

impl From<&ServiceRequest> for ServiceRoute {
    fn from(req: &ServiceRequest) -> Self {
        Self {
            hub: req.hub,
            id: req.id,
            service_type: req.service_type.clone(),
            labels: req.labels.clone(),
        }
    }
}

/// Control plane to hubs: the full set of services of one account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountServices {
    pub account: Account,
    pub services: Vec<ServiceRoute>,
}

/// Maps a set of labels on one account to a target label set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelLink {
    pub account: Account,
    pub labels: LabelSet,
    pub target: LabelSet,
}

impl LabelLink {
    pub fn new(account: Account, labels: LabelSet, target: LabelSet) -> Self {
        Self {
            account,
            labels,
            target,
        }
    }

    /// Rewrite `labels` to the link target if this link applies to them
    pub fn resolve(&self, labels: &LabelSet) -> Option<&LabelSet> {
        (self.labels == *labels).then_some(&self.target)
    }
}

/// Control plane to hubs: label links that changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelLinks {
    pub label_links: Vec<LabelLink>,
}

/// Empty RPC response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Noop;

/// Build a label set from `(name, value)` pairs
pub fn label_set(pairs: &[(&str, &str)]) -> LabelSet {
    LabelSet::new(pairs.iter().map(|(name, value)| Label::new(*name, *value)))
}
