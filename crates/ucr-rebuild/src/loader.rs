//! Streaming row loads
//!
//! A [`RowLoader`] owns one transaction for its whole session. Documents are
//! fed one at a time; the first time a document id is seen its previous rows
//! are deleted, then its new rows are buffered and inserted in batches.
//! [`RowLoader::finish`] flushes, commits and reports what happened.
//! Dropping a loader without finishing rolls the session back.

use chrono::{Datelike, NaiveDate};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use ucr_rdbc::dialect::SqlDialect;
use ucr_rdbc::security::MAX_IDENTIFIER_LEN;
use ucr_rdbc::types::{Row, TableMetadata};
use ucr_rdbc::{Connection, Transaction, Value};

use crate::definition::{PartitionRule, PartitionScheme, DOC_ID_COLUMN, INSERTED_AT_COLUMN};
use crate::error::Result;

/// Default rows per insert batch
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Summary of a load session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// Distinct documents fed
    pub documents: u64,
    /// Rows inserted
    pub rows_inserted: u64,
    /// Stale rows deleted
    pub rows_deleted: u64,
    /// Partitions created on the way
    pub partitions_created: u64,
    /// Session duration
    pub elapsed: Duration,
}

impl LoadStats {
    /// Fold another session's stats into this one
    pub fn merge(&mut self, other: &LoadStats) {
        self.documents += other.documents;
        self.rows_inserted += other.rows_inserted;
        self.rows_deleted += other.rows_deleted;
        self.partitions_created += other.partitions_created;
        self.elapsed += other.elapsed;
    }
}

/// One load session against one table
pub struct RowLoader {
    tx: Box<dyn Transaction>,
    dialect: Arc<dyn SqlDialect>,
    table: TableMetadata,
    partition: Option<PartitionScheme>,
    batch_size: usize,
    seen: HashSet<String>,
    partitions: HashSet<String>,
    buffer: Vec<Row>,
    stats: LoadStats,
    started: Instant,
}

impl RowLoader {
    /// Open a session on `conn`
    pub async fn begin(
        conn: &dyn Connection,
        dialect: Arc<dyn SqlDialect>,
        table: TableMetadata,
        partition: Option<PartitionScheme>,
    ) -> Result<Self> {
        let tx = conn.begin().await?;
        Ok(Self {
            tx,
            dialect,
            table,
            partition,
            batch_size: DEFAULT_BATCH_SIZE,
            seen: HashSet::new(),
            partitions: HashSet::new(),
            buffer: Vec::new(),
            stats: LoadStats::default(),
            started: Instant::now(),
        })
    }

    /// Set the insert batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Replace the rows of one document
    pub async fn feed(&mut self, doc_id: &str, rows: Vec<Row>) -> Result<()> {
        if self.seen.insert(doc_id.to_string()) {
            self.stats.documents += 1;
            let sql = self.dialect.delete_sql(&self.table, &[DOC_ID_COLUMN]);
            self.stats.rows_deleted += self.tx.execute(&sql, &[Value::from(doc_id)]).await?;
        }

        let inserted_at = Value::DateTime(chrono::Utc::now().naive_utc());
        for row in rows {
            let row = self.complete_row(doc_id, &inserted_at, row);
            self.buffer.push(row);
        }
        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Flush, commit and report
    pub async fn finish(mut self) -> Result<LoadStats> {
        if let Err(e) = self.flush().await {
            self.tx.rollback().await?;
            return Err(e);
        }
        self.tx.commit().await?;
        self.stats.elapsed = self.started.elapsed();
        debug!(
            table = %self.table.name,
            documents = self.stats.documents,
            rows = self.stats.rows_inserted,
            "load session committed"
        );
        Ok(self.stats)
    }

    /// Discard everything fed in this session
    pub async fn abort(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    fn complete_row(&self, doc_id: &str, inserted_at: &Value, row: Row) -> Row {
        let values = self
            .table
            .columns
            .iter()
            .map(|column| match column.name.as_str() {
                DOC_ID_COLUMN => Value::from(doc_id),
                INSERTED_AT_COLUMN => inserted_at.clone(),
                name => row.get_by_name(name).cloned().unwrap_or(Value::Null),
            })
            .collect();
        Row::new(self.table.column_names().iter().map(|c| c.to_string()).collect(), values)
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.buffer);

        if let Some(scheme) = self.partition.clone() {
            for row in &rows {
                if let Some(date) = row.get_by_name(&scheme.column).and_then(Value::as_date) {
                    self.ensure_partition(scheme.rule, date).await?;
                }
            }
        }

        let columns = self.table.column_names();
        let sql = self.dialect.insert_sql(&self.table, &columns)?;
        for row in &rows {
            self.stats.rows_inserted += self.tx.execute(&sql, row.values()).await?;
        }
        Ok(())
    }

    async fn ensure_partition(&mut self, rule: PartitionRule, date: NaiveDate) -> Result<()> {
        let (from, to) = partition_bounds(rule, date);
        let child = partition_name(&self.table.name, from);
        if self.partitions.contains(&child) {
            return Ok(());
        }
        let sql = self.dialect.range_partition_sql(
            &self.table.name,
            &child,
            &from.format("%Y-%m-%d").to_string(),
            &to.format("%Y-%m-%d").to_string(),
        )?;
        self.tx.execute(&sql, &[]).await?;
        self.partitions.insert(child);
        self.stats.partitions_created += 1;
        Ok(())
    }
}

/// Half-open `[from, to)` bucket containing `date`
pub fn partition_bounds(rule: PartitionRule, date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let first_of = |year: i32, month: u32| NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date);
    match rule {
        PartitionRule::Day => (date, date.succ_opt().unwrap_or(date)),
        PartitionRule::Month => {
            let from = first_of(date.year(), date.month());
            let to = if date.month() == 12 {
                first_of(date.year() + 1, 1)
            } else {
                first_of(date.year(), date.month() + 1)
            };
            (from, to)
        }
        PartitionRule::Year => (first_of(date.year(), 1), first_of(date.year() + 1, 1)),
    }
}

/// Child table name for the bucket starting at `from`
pub fn partition_name(parent: &str, from: NaiveDate) -> String {
    let suffix = format!("_p{}", from.format("%Y%m%d"));
    let mut end = parent.len().min(MAX_IDENTIFIER_LEN - suffix.len());
    while !parent.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &parent[..end], suffix)
}

/// Name of the catch-all partition
pub fn default_partition_name(parent: &str) -> String {
    let suffix = "_default";
    let mut end = parent.len().min(MAX_IDENTIFIER_LEN - suffix.len());
    while !parent.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &parent[..end], suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_partition_bounds() {
        assert_eq!(
            partition_bounds(PartitionRule::Day, date(2024, 2, 29)),
            (date(2024, 2, 29), date(2024, 3, 1))
        );
        assert_eq!(
            partition_bounds(PartitionRule::Month, date(2024, 12, 15)),
            (date(2024, 12, 1), date(2025, 1, 1))
        );
        assert_eq!(
            partition_bounds(PartitionRule::Year, date(2024, 6, 1)),
            (date(2024, 1, 1), date(2025, 1, 1))
        );
    }

    #[test]
    fn test_partition_names_fit_identifier_limit() {
        let parent = "t".repeat(63);
        assert_eq!(partition_name(&parent, date(2024, 1, 1)).len(), MAX_IDENTIFIER_LEN);
        assert!(partition_name("visits", date(2024, 1, 1)).ends_with("_p20240101"));
        assert_eq!(default_partition_name("visits"), "visits_default");
    }
}
