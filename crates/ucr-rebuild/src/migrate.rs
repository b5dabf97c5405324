//! In-place migration of live tables
//!
//! Only nullable column additions are executed, all of them inside a single
//! transaction. Index additions and removals are never executed: the exact
//! `CREATE INDEX CONCURRENTLY` / `DROP INDEX CONCURRENTLY` statements are
//! logged for an operator, since concurrent index builds cannot share a
//! transaction with other DDL and lock-free builds on large tables need a
//! human watching them.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use ucr_rdbc::dialect::{PostgresDialect, SqlDialect};
use ucr_rdbc::Connection;

use crate::diff::{DiffSummary, SchemaDiff};
use crate::error::Result;

/// Per-table summaries of what a migration applied (or logged)
pub type AppliedDiffs = BTreeMap<String, Vec<DiffSummary>>;

/// Applies additive changes to live tables
pub struct TableMigrator {
    dialect: Arc<dyn SqlDialect>,
    schema: Option<String>,
}

impl Default for TableMigrator {
    fn default() -> Self {
        Self::new()
    }
}

impl TableMigrator {
    /// Migrator for PostgreSQL
    pub fn new() -> Self {
        Self {
            dialect: Arc::new(PostgresDialect),
            schema: None,
        }
    }

    /// Use a custom dialect
    pub fn with_dialect(mut self, dialect: Arc<dyn SqlDialect>) -> Self {
        self.dialect = dialect;
        self
    }

    /// Target a database schema
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Apply `diffs` on `conn`.
    ///
    /// Diffs other than nullable column adds and index changes are ignored.
    /// If any column add fails, none are applied.
    pub async fn migrate(
        &self,
        conn: &dyn Connection,
        diffs: &[SchemaDiff],
    ) -> Result<AppliedDiffs> {
        let mut applied = AppliedDiffs::new();

        let columns: Vec<_> = diffs
            .iter()
            .filter_map(|d| match d {
                SchemaDiff::AddNullableColumn { table, column } => Some((d, table, column)),
                _ => None,
            })
            .collect();

        if !columns.is_empty() {
            let tx = conn.begin().await?;
            for (_, table, column) in &columns {
                // Work on a detached copy; the definition keeps its own
                let mut column = (*column).clone();
                column.primary_key_ordinal = None;
                column.nullable = true;

                let sql = self
                    .dialect
                    .add_column_sql(self.schema.as_deref(), table, &column)?;
                if let Err(e) = tx.execute(&sql, &[]).await {
                    tx.rollback().await?;
                    return Err(e.into());
                }
            }
            tx.commit().await?;

            for (diff, table, column) in &columns {
                info!(table = %table, column = %column.name, "added nullable column");
                applied
                    .entry(table.to_string())
                    .or_default()
                    .push(diff.summary());
            }
        }

        for diff in diffs {
            if let Some(statement) = self.operator_statement(diff) {
                let table = diff.table_name().unwrap_or_default();
                warn!(
                    table,
                    statement = %statement,
                    "index change needs manual migration: {}", statement
                );
                applied
                    .entry(table.to_string())
                    .or_default()
                    .push(diff.summary());
            }
        }

        Ok(applied)
    }

    /// The statement an operator must run by hand for an index diff
    pub fn operator_statement(&self, diff: &SchemaDiff) -> Option<String> {
        match diff {
            SchemaDiff::AddIndex { index, .. } => {
                Some(self.dialect.create_index_concurrently_sql(index))
            }
            SchemaDiff::RemoveIndex { index, .. } => {
                Some(self.dialect.drop_index_concurrently_sql(&index.name))
            }
            _ => None,
        }
    }

    /// Operator statements for every index diff, in order
    pub fn operator_statements(&self, diffs: &[SchemaDiff]) -> Vec<String> {
        diffs
            .iter()
            .filter_map(|d| self.operator_statement(d))
            .collect()
    }
}
