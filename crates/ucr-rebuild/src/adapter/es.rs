use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;
use ucr_rdbc::types::Row;

use super::IndicatorAdapter;
use crate::definition::{DataSourceConfig, TableDefinition};
use crate::error::Result;
use crate::producer::RowProducer;

/// Minimal document-index contract
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Whether the index exists
    async fn index_exists(&self, index: &str) -> Result<bool>;

    /// Create the index if missing
    async fn create_index(&self, index: &str) -> Result<()>;

    /// Delete the index and everything in it
    async fn delete_index(&self, index: &str) -> Result<()>;

    /// Store a document, replacing any previous version
    async fn put(&self, index: &str, id: &str, body: serde_json::Value) -> Result<()>;

    /// Remove a document
    async fn remove(&self, index: &str, id: &str) -> Result<()>;
}

/// In-process document index
#[derive(Default)]
pub struct MemoryDocumentIndex {
    indexes: RwLock<HashMap<String, BTreeMap<String, serde_json::Value>>>,
}

impl MemoryDocumentIndex {
    /// Empty index set
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a stored document
    pub fn get(&self, index: &str, id: &str) -> Option<serde_json::Value> {
        self.indexes.read().get(index)?.get(id).cloned()
    }

    /// Number of documents in an index
    pub fn count(&self, index: &str) -> usize {
        self.indexes.read().get(index).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl DocumentIndex for MemoryDocumentIndex {
    async fn index_exists(&self, index: &str) -> Result<bool> {
        Ok(self.indexes.read().contains_key(index))
    }

    async fn create_index(&self, index: &str) -> Result<()> {
        self.indexes.write().entry(index.to_string()).or_default();
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        self.indexes.write().remove(index);
        Ok(())
    }

    async fn put(&self, index: &str, id: &str, body: serde_json::Value) -> Result<()> {
        self.indexes
            .write()
            .entry(index.to_string())
            .or_default()
            .insert(id.to_string(), body);
        Ok(())
    }

    async fn remove(&self, index: &str, id: &str) -> Result<()> {
        if let Some(docs) = self.indexes.write().get_mut(index) {
            docs.remove(id);
        }
        Ok(())
    }
}

/// Data source stored in a search index, one entry per document holding
/// all of its rows
pub struct EsIndicatorAdapter {
    config: DataSourceConfig,
    definition: TableDefinition,
    index: Arc<dyn DocumentIndex>,
    producer: Arc<dyn RowProducer>,
}

impl EsIndicatorAdapter {
    /// Create an adapter
    pub fn new(
        config: DataSourceConfig,
        definition: TableDefinition,
        index: Arc<dyn DocumentIndex>,
        producer: Arc<dyn RowProducer>,
    ) -> Self {
        Self {
            config,
            definition,
            index,
            producer,
        }
    }
}

fn row_to_json(row: Row) -> serde_json::Value {
    serde_json::Value::Object(
        row.into_map()
            .into_iter()
            .map(|(k, v)| (k, v.to_json()))
            .collect(),
    )
}

#[async_trait]
impl IndicatorAdapter for EsIndicatorAdapter {
    fn config(&self) -> &DataSourceConfig {
        &self.config
    }

    fn definition(&self) -> &TableDefinition {
        &self.definition
    }

    fn producer(&self) -> &dyn RowProducer {
        self.producer.as_ref()
    }

    fn is_schema_managed(&self) -> bool {
        false
    }

    async fn table_exists(&self) -> Result<bool> {
        self.index.index_exists(self.table_name()).await
    }

    async fn build_table(&self) -> Result<()> {
        self.index.create_index(self.table_name()).await
    }

    async fn rebuild_table(&self) -> Result<()> {
        self.index.delete_index(self.table_name()).await?;
        self.index.create_index(self.table_name()).await?;
        info!(index = %self.table_name(), "index recreated");
        Ok(())
    }

    async fn drop_table(&self) -> Result<()> {
        self.index.delete_index(self.table_name()).await
    }

    async fn save_rows(&self, doc_id: &str, rows: Vec<Row>) -> Result<()> {
        let body = serde_json::json!({
            "doc_id": doc_id,
            "rows": rows.into_iter().map(row_to_json).collect::<Vec<_>>(),
        });
        self.index.put(self.table_name(), doc_id, body).await
    }

    async fn delete(&self, doc_id: &str) -> Result<()> {
        self.index.remove(self.table_name(), doc_id).await
    }
}
