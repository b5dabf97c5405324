//! Relational indicator tables on an engine connection

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use ucr_rdbc::dialect::{PostgresDialect, SqlDialect};
use ucr_rdbc::schema::IndexMetadata;
use ucr_rdbc::types::{Row, TableMetadata};
use ucr_rdbc::{Transaction, Value};

use super::IndicatorAdapter;
use crate::connections::EngineHandle;
use crate::definition::{DataSourceConfig, TableDefinition, DOC_ID_COLUMN};
use crate::error::{RebuildError, Result};
use crate::loader::{default_partition_name, LoadStats, RowLoader, DEFAULT_BATCH_SIZE};
use crate::producer::{Document, RowProducer};

/// Relational table on an engine connection
pub struct SqlIndicatorAdapter {
    config: DataSourceConfig,
    definition: TableDefinition,
    table: TableMetadata,
    indexes: Vec<IndexMetadata>,
    engine: EngineHandle,
    dialect: Arc<dyn SqlDialect>,
    producer: Arc<dyn RowProducer>,
    batch_size: usize,
}

impl SqlIndicatorAdapter {
    /// Create an adapter
    pub fn new(
        config: DataSourceConfig,
        definition: TableDefinition,
        engine: EngineHandle,
        producer: Arc<dyn RowProducer>,
    ) -> Self {
        let table = definition.to_table_metadata();
        let indexes = definition.index_metadata();
        Self {
            config,
            definition,
            table,
            indexes,
            engine,
            dialect: Arc::new(PostgresDialect),
            producer,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Rows per insert batch
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Expected table metadata
    pub fn table_metadata(&self) -> &TableMetadata {
        &self.table
    }

    /// Start a load session
    pub async fn loader(&self) -> Result<RowLoader> {
        Ok(RowLoader::begin(
            self.engine.connection.as_ref(),
            Arc::clone(&self.dialect),
            self.table.clone(),
            self.definition.partition.clone(),
        )
        .await?
        .with_batch_size(self.batch_size))
    }

    /// Roll back a failed load and hand back the error that caused it
    async fn abort(&self, loader: RowLoader, cause: RebuildError) -> RebuildError {
        if let Err(e) = loader.abort().await {
            warn!(table = %self.table.name, error = %e, "rollback of failed load failed");
        }
        cause
    }

    async fn create_in(&self, tx: &dyn Transaction) -> Result<()> {
        let partition_column = self.definition.partition.as_ref().map(|p| p.column.as_str());
        tx.execute(&self.dialect.create_table_sql(&self.table, partition_column)?, &[])
            .await?;
        if partition_column.is_some() {
            let default = default_partition_name(&self.table.name);
            tx.execute(&self.dialect.default_partition_sql(&self.table.name, &default)?, &[])
                .await?;
        }
        for index in &self.indexes {
            tx.execute(&self.dialect.create_index_sql(index)?, &[]).await?;
        }
        Ok(())
    }

    async fn run_ddl(&self, drop_first: bool) -> Result<()> {
        let tx = self.engine.connection.begin().await?;
        let result: Result<()> = async {
            if drop_first {
                tx.execute(&self.dialect.drop_table_sql(None, &self.table.name)?, &[])
                    .await?;
            }
            self.create_in(tx.as_ref()).await
        }
        .await;

        match result {
            Ok(()) => Ok(tx.commit().await?),
            Err(e) => {
                tx.rollback().await?;
                Err(RebuildError::table_rebuild(&self.table.name, e))
            }
        }
    }
}

#[async_trait]
impl IndicatorAdapter for SqlIndicatorAdapter {
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
        true
    }

    async fn table_exists(&self) -> Result<bool> {
        Ok(self.engine.schema.table_exists(None, &self.table.name).await?)
    }

    async fn build_table(&self) -> Result<()> {
        self.run_ddl(false).await?;
        debug!(table = %self.table.name, "table ensured");
        Ok(())
    }

    async fn rebuild_table(&self) -> Result<()> {
        self.run_ddl(true).await?;
        info!(table = %self.table.name, engine = %self.engine.engine_id, "table recreated");
        Ok(())
    }

    async fn drop_table(&self) -> Result<()> {
        let sql = self.dialect.drop_table_sql(None, &self.table.name)?;
        self.engine.connection.execute(&sql, &[]).await?;
        info!(table = %self.table.name, "table dropped");
        Ok(())
    }

    async fn save_rows(&self, doc_id: &str, rows: Vec<Row>) -> Result<()> {
        let mut loader = self.loader().await?;
        if let Err(e) = loader.feed(doc_id, rows).await {
            return Err(self.abort(loader, e).await);
        }
        loader.finish().await?;
        Ok(())
    }

    async fn delete(&self, doc_id: &str) -> Result<()> {
        let sql = self.dialect.delete_sql(&self.table, &[DOC_ID_COLUMN]);
        self.engine
            .connection
            .execute(&sql, &[Value::from(doc_id)])
            .await?;
        Ok(())
    }

    async fn bulk_delete(&self, doc_ids: &[String]) -> Result<()> {
        if doc_ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "DELETE FROM {} WHERE {} = ANY($1)",
            self.dialect.quote_identifier(&self.table.name),
            self.dialect.quote_identifier(DOC_ID_COLUMN)
        );
        self.engine
            .connection
            .execute(&sql, &[Value::Array(doc_ids.to_vec())])
            .await?;
        Ok(())
    }

    async fn save_documents(&self, docs: &[Document]) -> Result<LoadStats> {
        let mut loader = self.loader().await?;
        for doc in docs {
            match self.producer.rows(&self.config, doc) {
                Ok(Some(rows)) => {
                    if let Err(e) = loader.feed(&doc.id, rows).await {
                        return Err(self.abort(loader, e).await);
                    }
                }
                // Feeding no rows still clears the document's old rows
                Ok(None) => {
                    if let Err(e) = loader.feed(&doc.id, Vec::new()).await {
                        return Err(self.abort(loader, e).await);
                    }
                }
                Err(e) => {
                    warn!(
                        doc_id = %doc.id,
                        table = %self.table.name,
                        error = %e,
                        "skipping document"
                    );
                }
            }
        }
        loader.finish().await
    }
}
