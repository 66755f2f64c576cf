//! Sources of hub addresses for the broadcaster

use async_trait::async_trait;
use std::sync::RwLock;

/// Lists the hubs an update must reach
///
/// Asked afresh on every broadcast.
#[async_trait]
pub trait HubCatalog: Send + Sync {
    async fn targets(&self) -> Vec<String>;
}

/// A fixed list of hub addresses
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    targets: Vec<String>,
}

impl StaticCatalog {
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl HubCatalog for StaticCatalog {
    async fn targets(&self) -> Vec<String> {
        self.targets.clone()
    }
}

/// A hub list that a discovery mechanism keeps up to date
#[derive(Debug, Default)]
pub struct SharedCatalog {
    targets: RwLock<Vec<String>>,
}

impl SharedCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole list
    pub fn set_targets(&self, targets: Vec<String>) {
        *self.write() = targets;
    }

    /// Add `target` unless it is already listed
    pub fn add_target(&self, target: impl Into<String>) {
        let target = target.into();
        let mut targets = self.write();
        if !targets.contains(&target) {
            targets.push(target);
        }
    }

    pub fn remove_target(&self, target: &str) -> bool {
        let mut targets = self.write();
        let before = targets.len();
        targets.retain(|t| t != target);
        targets.len() != before
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<String>> {
        self.targets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl HubCatalog for SharedCatalog {
    async fn targets(&self) -> Vec<String> {
        self.targets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_catalog() {
        let catalog = StaticCatalog::new(["hub-1:443", "hub-2:443"]);
        assert_eq!(catalog.targets().await, vec!["hub-1:443", "hub-2:443"]);
    }

    #[tokio::test]
    async fn test_shared_catalog_updates_are_seen() {
        let catalog = SharedCatalog::new();
        assert!(catalog.targets().await.is_empty());

        catalog.add_target("hub-1:443");
        catalog.add_target("hub-2:443");
        catalog.add_target("hub-1:443");
        assert_eq!(catalog.targets().await.len(), 2);

        assert!(catalog.remove_target("hub-1:443"));
        assert!(!catalog.remove_target("hub-9:443"));
        assert_eq!(catalog.targets().await, vec!["hub-2:443"]);

        catalog.set_targets(vec!["hub-3:443".to_string()]);
        assert_eq!(catalog.targets().await, vec!["hub-3:443"]);
    }
}
