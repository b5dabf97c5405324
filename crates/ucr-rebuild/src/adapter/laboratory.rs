//! Dual-write adapter for trying a second backend alongside the primary

use async_trait::async_trait;
use metrics::Counter;
use std::sync::Arc;
use tracing::warn;
use ucr_rdbc::types::Row;

use super::IndicatorAdapter;
use crate::definition::{DataSourceConfig, TableDefinition};
use crate::error::Result;
use crate::producer::RowProducer;

/// Dual-writing adapter for backend trials.
///
/// Every operation runs on the primary first and its result is returned.
/// The candidate then receives the same operation; its failures are logged
/// and counted but never surface to the caller.
pub struct LaboratoryAdapter {
    primary: Arc<dyn IndicatorAdapter>,
    candidate: Arc<dyn IndicatorAdapter>,
    candidate_errors: Counter,
}

impl LaboratoryAdapter {
    /// Pair a primary with a candidate
    pub fn new(primary: Arc<dyn IndicatorAdapter>, candidate: Arc<dyn IndicatorAdapter>) -> Self {
        Self {
            primary,
            candidate,
            candidate_errors: metrics::counter!("ucr_laboratory_candidate_errors_total"),
        }
    }

    /// The authoritative adapter
    pub fn primary(&self) -> &Arc<dyn IndicatorAdapter> {
        &self.primary
    }

    /// The adapter under trial
    pub fn candidate(&self) -> &Arc<dyn IndicatorAdapter> {
        &self.candidate
    }

    fn record_candidate<T>(&self, operation: &str, result: Result<T>) {
        if let Err(e) = result {
            self.candidate_errors.increment(1);
            warn!(
                table = %self.primary.table_name(),
                operation,
                error = %e,
                "laboratory candidate failed"
            );
        }
    }
}

#[async_trait]
impl IndicatorAdapter for LaboratoryAdapter {
    fn config(&self) -> &DataSourceConfig {
        self.primary.config()
    }

    fn definition(&self) -> &TableDefinition {
        self.primary.definition()
    }

    fn producer(&self) -> &dyn RowProducer {
        self.primary.producer()
    }

    fn is_schema_managed(&self) -> bool {
        self.primary.is_schema_managed()
    }

    async fn table_exists(&self) -> Result<bool> {
        self.primary.table_exists().await
    }

    async fn build_table(&self) -> Result<()> {
        self.primary.build_table().await?;
        self.record_candidate("build_table", self.candidate.build_table().await);
        Ok(())
    }

    async fn rebuild_table(&self) -> Result<()> {
        self.primary.rebuild_table().await?;
        self.record_candidate("rebuild_table", self.candidate.rebuild_table().await);
        Ok(())
    }

    async fn drop_table(&self) -> Result<()> {
        self.primary.drop_table().await?;
        self.record_candidate("drop_table", self.candidate.drop_table().await);
        Ok(())
    }

    async fn save_rows(&self, doc_id: &str, rows: Vec<Row>) -> Result<()> {
        self.primary.save_rows(doc_id, rows.clone()).await?;
        self.record_candidate("save_rows", self.candidate.save_rows(doc_id, rows).await);
        Ok(())
    }

    async fn delete(&self, doc_id: &str) -> Result<()> {
        self.primary.delete(doc_id).await?;
        self.record_candidate("delete", self.candidate.delete(doc_id).await);
        Ok(())
    }

    async fn bulk_delete(&self, doc_ids: &[String]) -> Result<()> {
        self.primary.bulk_delete(doc_ids).await?;
        self.record_candidate("bulk_delete", self.candidate.bulk_delete(doc_ids).await);
        Ok(())
    }
}
