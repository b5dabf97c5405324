//! Schema discovery for ucr-rdbc
//!
//! Provides:
//! - SchemaProvider: read-only introspection of live tables and indexes
//! - PgSchemaProvider: catalog-backed implementation over any [`Connection`]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::connection::Connection;
use crate::dialect::{PostgresDialect, SqlDialect};
use crate::error::Result;
use crate::types::{ColumnMetadata, TableMetadata, Value};

/// Schema provider for read-only schema discovery
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// List all tables in a schema
    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<String>>;

    /// Get table metadata
    async fn get_table(&self, schema: Option<&str>, table: &str) -> Result<Option<TableMetadata>>;

    /// Check if a table exists
    async fn table_exists(&self, schema: Option<&str>, table: &str) -> Result<bool> {
        Ok(self.get_table(schema, table).await?.is_some())
    }

    /// List all indexes on a table
    async fn list_indexes(&self, schema: Option<&str>, table: &str) -> Result<Vec<IndexMetadata>>;
}

/// Index metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Schema name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Table name
    pub table: String,
    /// Index name
    pub name: String,
    /// Column names (in order)
    pub columns: Vec<String>,
    /// Whether the index is unique
    #[serde(default)]
    pub unique: bool,
    /// Whether this is the primary key index
    #[serde(default)]
    pub primary: bool,
}

impl IndexMetadata {
    /// Create a new index metadata
    pub fn new(table: impl Into<String>, name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            schema: None,
            table: table.into(),
            name: name.into(),
            columns,
            unique: false,
            primary: false,
        }
    }

    /// Set as unique index
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Set as primary key index
    pub fn primary(mut self) -> Self {
        self.primary = true;
        self.unique = true;
        self
    }
}

/// PostgreSQL schema provider reading `information_schema` and `pg_catalog`
pub struct PgSchemaProvider {
    conn: Arc<dyn Connection>,
    dialect: PostgresDialect,
}

impl PgSchemaProvider {
    /// Create a new schema provider
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self {
            conn,
            dialect: PostgresDialect,
        }
    }
}

fn column_from_row(row: &crate::types::Row) -> ColumnMetadata {
    let name = row
        .get_by_name("column_name")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let type_name = row
        .get_by_name("data_type")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    ColumnMetadata {
        name: name.to_string(),
        type_name: type_name.to_string(),
        nullable: row
            .get_by_name("nullable")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
        primary_key_ordinal: row
            .get_by_name("pk_ordinal")
            .and_then(|v| v.as_i64())
            .map(|v| v as u32),
        ordinal: row
            .get_by_name("ordinal_position")
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as u32,
        max_length: row
            .get_by_name("character_maximum_length")
            .and_then(|v| v.as_i64())
            .map(|v| v as u32),
        default_value: row
            .get_by_name("column_default")
            .and_then(|v| v.as_str())
            .map(String::from),
    }
}

#[async_trait]
impl SchemaProvider for PgSchemaProvider {
    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<String>> {
        let schema = schema.unwrap_or("public");
        let rows = self
            .conn
            .query(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE' \
                 ORDER BY table_name",
                &[Value::String(schema.to_string())],
            )
            .await?;

        Ok(rows
            .iter()
            .filter_map(|r| {
                r.get_by_name("table_name")
                    .and_then(|v| v.as_str().map(String::from))
            })
            .collect())
    }

    async fn get_table(&self, schema: Option<&str>, table: &str) -> Result<Option<TableMetadata>> {
        let schema = schema.unwrap_or("public");
        let sql = self.dialect.list_columns_sql(Some(schema), table);
        let rows = self.conn.query(&sql, &[]).await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut table_meta = TableMetadata::new(table);
        table_meta.schema = Some(schema.to_string());
        table_meta.columns = rows.iter().map(column_from_row).collect();

        Ok(Some(table_meta))
    }

    async fn list_indexes(&self, schema: Option<&str>, table: &str) -> Result<Vec<IndexMetadata>> {
        let schema = schema.unwrap_or("public");
        let rows = self
            .conn
            .query(
                r#"SELECT
                    i.relname AS index_name,
                    a.attname AS column_name,
                    ix.indisunique AS is_unique,
                    ix.indisprimary AS is_primary
                FROM pg_class t
                JOIN pg_namespace n ON t.relnamespace = n.oid
                JOIN pg_index ix ON t.oid = ix.indrelid
                JOIN pg_class i ON ix.indexrelid = i.oid
                JOIN LATERAL unnest(ix.indkey) WITH ORDINALITY AS k(attnum, pos) ON true
                JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
                WHERE n.nspname = $1 AND t.relname = $2
                ORDER BY i.relname, k.pos"#,
                &[
                    Value::String(schema.to_string()),
                    Value::String(table.to_string()),
                ],
            )
            .await?;

        // BTreeMap keeps index order stable between passes
        let mut indexes: BTreeMap<String, IndexMetadata> = BTreeMap::new();

        for row in &rows {
            let index_name = row
                .get_by_name("index_name")
                .and_then(|v| v.as_str())
                .unwrap_or_default();

            let column_name = row
                .get_by_name("column_name")
                .and_then(|v| v.as_str())
                .unwrap_or_default();

            let is_unique = row
                .get_by_name("is_unique")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            let is_primary = row
                .get_by_name("is_primary")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            let entry = indexes
                .entry(index_name.to_string())
                .or_insert_with(|| IndexMetadata {
                    schema: Some(schema.to_string()),
                    table: table.to_string(),
                    name: index_name.to_string(),
                    columns: vec![],
                    unique: is_unique,
                    primary: is_primary,
                });

            entry.columns.push(column_name.to_string());
        }

        Ok(indexes.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_metadata() {
        let idx = IndexMetadata::new("t1", "t1_pkey", vec!["doc_id".into()]).primary();
        assert!(idx.primary);
        assert!(idx.unique);

        let idx = IndexMetadata::new("t1", "ix_t1_owner", vec!["owner".into()]);
        assert!(!idx.unique);
    }

    #[test]
    fn test_column_from_row() {
        let row = crate::types::Row::from_pairs([
            ("column_name", Value::from("doc_id")),
            ("data_type", Value::from("text")),
            ("nullable", Value::Bool(false)),
            ("ordinal_position", Value::Int32(1)),
            ("column_default", Value::Null),
            ("character_maximum_length", Value::Null),
            ("pk_ordinal", Value::Int32(1)),
        ]);

        let column = column_from_row(&row);
        assert_eq!(column.name, "doc_id");
        assert!(!column.nullable);
        assert!(column.is_primary_key());
        assert_eq!(column.default_value, None);
    }
}
