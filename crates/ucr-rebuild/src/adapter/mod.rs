//! Indicator adapters
//!
//! An adapter owns the physical storage of one data source: it creates and
//! drops the table (or index) and writes the rows produced for each
//! document.
//!
//! ## Variants
//!
//! - [`SqlIndicatorAdapter`]: relational table on an engine connection; the
//!   only variant whose schema is reconciled
//! - [`EsIndicatorAdapter`]: search index behind a [`DocumentIndex`]
//! - [`LaboratoryAdapter`]: writes to a primary and a candidate adapter so
//!   a backend migration can be trialled; the primary is authoritative

mod es;
mod laboratory;
mod sql;

pub use es::{DocumentIndex, EsIndicatorAdapter, MemoryDocumentIndex};
pub use laboratory::LaboratoryAdapter;
pub use sql::SqlIndicatorAdapter;

use async_trait::async_trait;
use std::sync::Arc;
use ucr_rdbc::types::Row;

use crate::connections::ConnectionManager;
use crate::definition::{Backend, DataSourceConfig, TableDefinition, TableDefinitionProvider};
use crate::error::{RebuildError, Result};
use crate::loader::LoadStats;
use crate::producer::{Document, RowProducer};

/// What saving one document did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Rows written
    Saved(usize),
    /// Document filtered out; its rows were removed
    Removed,
}

/// Storage of one data source
#[async_trait]
pub trait IndicatorAdapter: Send + Sync {
    /// Configuration this adapter was built from
    fn config(&self) -> &DataSourceConfig;

    /// Table definition derived from the configuration
    fn definition(&self) -> &TableDefinition;

    /// Row producer for this data source
    fn producer(&self) -> &dyn RowProducer;

    /// Whether the storage has a relational schema to reconcile
    fn is_schema_managed(&self) -> bool;

    /// Physical table (or index) name
    fn table_name(&self) -> &str {
        &self.definition().table_name
    }

    /// Engine the table lives on
    fn engine_id(&self) -> &str {
        &self.config().engine_id
    }

    /// Whether the table exists
    async fn table_exists(&self) -> Result<bool>;

    /// Create the table if missing, leaving existing data alone
    async fn build_table(&self) -> Result<()>;

    /// Drop and recreate the table
    async fn rebuild_table(&self) -> Result<()>;

    /// Drop the table
    async fn drop_table(&self) -> Result<()>;

    /// Replace the rows of one document
    async fn save_rows(&self, doc_id: &str, rows: Vec<Row>) -> Result<()>;

    /// Remove the rows of one document
    async fn delete(&self, doc_id: &str) -> Result<()>;

    /// Remove the rows of many documents
    async fn bulk_delete(&self, doc_ids: &[String]) -> Result<()> {
        for doc_id in doc_ids {
            self.delete(doc_id).await?;
        }
        Ok(())
    }

    /// Produce and store the rows of one document
    async fn save_document(&self, doc: &Document) -> Result<SaveOutcome> {
        match self.producer().rows(self.config(), doc)? {
            Some(rows) => {
                let count = rows.len();
                self.save_rows(&doc.id, rows).await?;
                Ok(SaveOutcome::Saved(count))
            }
            None => {
                self.delete(&doc.id).await?;
                Ok(SaveOutcome::Removed)
            }
        }
    }

    /// Best-effort load of a chunk of documents.
    ///
    /// Documents the producer rejects are skipped and logged; storage errors
    /// abort the chunk.
    async fn save_documents(&self, docs: &[Document]) -> Result<LoadStats> {
        let started = std::time::Instant::now();
        let mut stats = LoadStats::default();
        for doc in docs {
            let rows = match self.producer().rows(self.config(), doc) {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(
                        doc_id = %doc.id,
                        table = %self.table_name(),
                        error = %e,
                        "skipping document"
                    );
                    continue;
                }
            };
            stats.documents += 1;
            match rows {
                Some(rows) => {
                    stats.rows_inserted += rows.len() as u64;
                    self.save_rows(&doc.id, rows).await?;
                }
                None => self.delete(&doc.id).await?,
            }
        }
        stats.elapsed = started.elapsed();
        Ok(stats)
    }
}

/// Builds adapters for configurations
pub struct AdapterFactory {
    connections: Arc<ConnectionManager>,
    definitions: Arc<dyn TableDefinitionProvider>,
    producer: Arc<dyn RowProducer>,
    document_index: Option<Arc<dyn DocumentIndex>>,
    load_batch_size: usize,
}

impl AdapterFactory {
    /// Factory for relational adapters
    pub fn new(
        connections: Arc<ConnectionManager>,
        definitions: Arc<dyn TableDefinitionProvider>,
        producer: Arc<dyn RowProducer>,
    ) -> Self {
        Self {
            connections,
            definitions,
            producer,
            document_index: None,
            load_batch_size: crate::loader::DEFAULT_BATCH_SIZE,
        }
    }

    /// Enable search-index and laboratory backends
    pub fn with_document_index(mut self, index: Arc<dyn DocumentIndex>) -> Self {
        self.document_index = Some(index);
        self
    }

    /// Rows per insert batch for relational loads
    pub fn with_load_batch_size(mut self, batch_size: usize) -> Self {
        self.load_batch_size = batch_size;
        self
    }

    /// Engine registry
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Adapter for the configuration's backend
    pub fn build(&self, config: &DataSourceConfig) -> Result<Arc<dyn IndicatorAdapter>> {
        match config.backend {
            Backend::Sql => Ok(Arc::new(self.build_sql(config)?)),
            Backend::Es => Ok(Arc::new(self.build_es(config)?)),
            Backend::Laboratory => {
                let primary: Arc<dyn IndicatorAdapter> = Arc::new(self.build_sql(config)?);
                let candidate: Arc<dyn IndicatorAdapter> = Arc::new(self.build_es(config)?);
                Ok(Arc::new(LaboratoryAdapter::new(primary, candidate)))
            }
        }
    }

    /// Relational adapter regardless of backend
    pub fn build_sql(&self, config: &DataSourceConfig) -> Result<SqlIndicatorAdapter> {
        let definition = self.definitions.definition(config)?;
        let engine = self.connections.get(&config.engine_id)?;
        Ok(SqlIndicatorAdapter::new(
            config.clone(),
            definition,
            engine,
            Arc::clone(&self.producer),
        )
        .with_batch_size(self.load_batch_size))
    }

    fn build_es(&self, config: &DataSourceConfig) -> Result<EsIndicatorAdapter> {
        let index = self.document_index.clone().ok_or_else(|| {
            RebuildError::config(format!(
                "data source {} needs a document index but none is configured",
                config.id
            ))
        })?;
        let definition = self.definitions.definition(config)?;
        Ok(EsIndicatorAdapter::new(
            config.clone(),
            definition,
            index,
            Arc::clone(&self.producer),
        ))
    }
}
