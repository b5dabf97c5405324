//! Authoritative storage of data source configurations
//!
//! The engine never trusts the copy of a configuration it is holding: stale
//! checks and deactivation filters re-read through a [`ConfigStore`].

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::definition::{BuildInfo, DataSourceConfig};
use crate::error::{RebuildError, Result};

/// Read access to persisted configurations, plus build bookkeeping writes
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Fetch the latest persisted configuration
    async fn get(&self, id: &str) -> Result<Option<DataSourceConfig>>;

    /// Latest persisted revision
    async fn latest_revision(&self, id: &str) -> Result<Option<String>> {
        Ok(self.get(id).await?.map(|c| c.revision))
    }

    /// Persist build bookkeeping; does not change the revision
    async fn save_build_info(&self, id: &str, build: &BuildInfo) -> Result<()>;

    /// All configurations that are not deactivated
    async fn list_active(&self) -> Result<Vec<DataSourceConfig>>;
}

/// In-process configuration store
#[derive(Default)]
pub struct MemoryConfigStore {
    configs: RwLock<BTreeMap<String, DataSourceConfig>>,
}

impl MemoryConfigStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with configurations
    pub fn with_configs(configs: impl IntoIterator<Item = DataSourceConfig>) -> Self {
        let store = Self::new();
        for config in configs {
            store.upsert(config);
        }
        store
    }

    /// Insert or replace a configuration
    pub fn upsert(&self, config: DataSourceConfig) {
        self.configs.write().insert(config.id.clone(), config);
    }

    /// Delete a configuration
    pub fn remove(&self, id: &str) -> Option<DataSourceConfig> {
        self.configs.write().remove(id)
    }

    /// Deactivate a configuration in place
    pub fn deactivate(&self, id: &str) -> Result<()> {
        let mut configs = self.configs.write();
        let config = configs
            .get_mut(id)
            .ok_or_else(|| RebuildError::NotFound(id.to_string()))?;
        config.is_deactivated = true;
        Ok(())
    }

    /// Edit a configuration and bump its revision
    pub fn update(&self, id: &str, edit: impl FnOnce(&mut DataSourceConfig)) -> Result<String> {
        let mut configs = self.configs.write();
        let config = configs
            .get_mut(id)
            .ok_or_else(|| RebuildError::NotFound(id.to_string()))?;
        edit(config);
        config.revision = next_revision(&config.revision);
        Ok(config.revision.clone())
    }
}

fn next_revision(revision: &str) -> String {
    let (number, suffix) = revision.split_once('-').unwrap_or((revision, ""));
    let next = number.parse::<u64>().map(|n| n + 1).unwrap_or(1);
    if suffix.is_empty() {
        next.to_string()
    } else {
        format!("{}-{}", next, suffix)
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, id: &str) -> Result<Option<DataSourceConfig>> {
        Ok(self.configs.read().get(id).cloned())
    }

    async fn save_build_info(&self, id: &str, build: &BuildInfo) -> Result<()> {
        let mut configs = self.configs.write();
        let config = configs
            .get_mut(id)
            .ok_or_else(|| RebuildError::NotFound(id.to_string()))?;
        config.build = build.clone();
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<DataSourceConfig>> {
        Ok(self
            .configs
            .read()
            .values()
            .filter(|c| !c.is_deactivated)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_bumps_revision() {
        let store =
            MemoryConfigStore::with_configs([DataSourceConfig::new("abc", "demo", "cases")]);
        let rev = store.update("abc", |c| c.display_name = Some("Cases".into())).unwrap();
        assert_eq!(rev, "2");
        assert_eq!(store.latest_revision("abc").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_build_info_keeps_revision() {
        let store =
            MemoryConfigStore::with_configs([DataSourceConfig::new("abc", "demo", "cases")]);
        let build = BuildInfo {
            finished: true,
            ..Default::default()
        };
        store.save_build_info("abc", &build).await.unwrap();
        let config = store.get("abc").await.unwrap().unwrap();
        assert!(config.build.finished);
        assert_eq!(config.revision, "1");
    }

    #[tokio::test]
    async fn test_deactivated_not_listed() {
        let store = MemoryConfigStore::with_configs([
            DataSourceConfig::new("a", "demo", "t1"),
            DataSourceConfig::new("b", "demo", "t2"),
        ]);
        store.deactivate("a").unwrap();
        let active: Vec<_> = store.list_active().await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(active, vec!["b"]);
    }
}
