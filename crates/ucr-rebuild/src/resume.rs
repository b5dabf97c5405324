//! Resume checkpoints for long-running builds
//!
//! A build walks a data source's units (one per domain and case type or
//! form) and records each finished unit in a shared list. After a crash the
//! next attempt reads the list and skips what is already done.
//!
//! The list key embeds the configuration revision, so editing a data source
//! starts its progress over instead of replaying units under an old schema.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::definition::DataSourceConfig;
use crate::error::Result;
use crate::store::ListStore;

/// Marker stored for units without a key
pub const NO_UNIT: &str = "None";

/// Revision used for built-in configurations
pub const STATIC_REVISION: &str = "static";

/// One finished unit of a build
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompletedUnit {
    /// Domain the unit belongs to
    pub domain: String,
    /// Case type / form xmlns, or `None` for whole-domain units
    pub unit: Option<String>,
}

impl CompletedUnit {
    /// Create a marker
    pub fn new(domain: impl Into<String>, unit: Option<&str>) -> Self {
        Self {
            domain: domain.into(),
            unit: unit.map(String::from),
        }
    }

    /// Stored form: `{domain}.{unit}`
    pub fn encode(&self) -> String {
        format!("{}.{}", self.domain, self.unit.as_deref().unwrap_or(NO_UNIT))
    }

    /// Parse a stored marker; the domain never contains a dot
    pub fn decode(raw: &str) -> Self {
        match raw.split_once('.') {
            Some((domain, unit)) => Self {
                domain: domain.to_string(),
                unit: (unit != NO_UNIT).then(|| unit.to_string()),
            },
            None => Self {
                domain: raw.to_string(),
                unit: None,
            },
        }
    }
}

impl fmt::Display for CompletedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Progress markers for one data source revision
pub struct ResumeHelper {
    store: Arc<dyn ListStore>,
    key: String,
}

impl ResumeHelper {
    /// Helper for a data source at its current revision
    pub fn new(store: Arc<dyn ListStore>, config: &DataSourceConfig) -> Self {
        Self::for_revision(store, &config.id, config.resume_revision())
    }

    /// Helper for an explicit id and revision
    pub fn for_revision(store: Arc<dyn ListStore>, config_id: &str, revision: &str) -> Self {
        Self {
            store,
            key: format!("ucr_queue-{}:{}", config_id, revision),
        }
    }

    /// Store key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Finished units in completion order
    pub async fn get_completed_units(&self) -> Result<Vec<CompletedUnit>> {
        let raw = self.store.range(&self.key).await?;
        Ok(raw.iter().map(|r| CompletedUnit::decode(r)).collect())
    }

    /// Record a finished unit
    pub async fn add_completed_unit(&self, domain: &str, unit: Option<&str>) -> Result<()> {
        let marker = CompletedUnit::new(domain, unit);
        debug!(key = %self.key, unit = %marker, "unit completed");
        self.store.push(&self.key, &marker.encode()).await
    }

    /// Drop all progress
    pub async fn clear(&self) -> Result<()> {
        self.store.delete(&self.key).await
    }

    /// Whether any unit has been recorded
    pub async fn has_resume_state(&self) -> Result<bool> {
        Ok(!self.store.range(&self.key).await?.is_empty())
    }
}
