//! Per-configuration audit trail of applied migrations

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::diff::DiffSummary;
use crate::error::Result;
use crate::store::ListStore;

/// One migration applied to a configuration's table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Diffs applied (or, for indexes, handed to an operator)
    pub diffs: Vec<DiffSummary>,
    /// Origin tag, e.g. the worker name
    pub source: String,
    /// When it was recorded
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Entry stamped now
    pub fn new(diffs: Vec<DiffSummary>, source: impl Into<String>) -> Self {
        Self {
            diffs,
            source: source.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// History attached to each configuration
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Append an entry
    async fn record(&self, config_id: &str, entry: AuditEntry) -> Result<()>;

    /// Entries in recording order
    async fn entries(&self, config_id: &str) -> Result<Vec<AuditEntry>>;
}

/// Audit log kept in a shared list store as JSON lines
pub struct StoreAuditLog {
    store: Arc<dyn ListStore>,
}

impl StoreAuditLog {
    /// Create the log
    pub fn new(store: Arc<dyn ListStore>) -> Self {
        Self { store }
    }

    fn key(config_id: &str) -> String {
        format!("ucr_audit-{}", config_id)
    }
}

#[async_trait]
impl AuditLog for StoreAuditLog {
    async fn record(&self, config_id: &str, entry: AuditEntry) -> Result<()> {
        let line = serde_json::to_string(&entry)?;
        self.store.push(&Self::key(config_id), &line).await
    }

    async fn entries(&self, config_id: &str) -> Result<Vec<AuditEntry>> {
        self.store
            .range(&Self::key(config_id))
            .await?
            .iter()
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DiffKind;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_entries_round_trip_in_order() {
        let log = StoreAuditLog::new(Arc::new(MemoryStore::new()));
        let diff = DiffSummary {
            kind: DiffKind::AddNullableColumn,
            table: Some("t1".into()),
            item: Some("owner".into()),
            columns: None,
        };
        log.record("abc", AuditEntry::new(vec![diff.clone()], "ucr-main")).await.unwrap();
        log.record("abc", AuditEntry::new(vec![], "ucr-static")).await.unwrap();

        let entries = log.entries("abc").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].diffs, vec![diff]);
        assert_eq!(entries[1].source, "ucr-static");
        assert!(log.entries("other").await.unwrap().is_empty());
    }
}
