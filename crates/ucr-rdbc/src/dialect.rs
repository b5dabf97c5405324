//! SQL dialect abstraction for ucr-rdbc
//!
//! Statement generation for report tables. Structured statements (create,
//! drop, alter, insert, delete) go through sea-query; the operator-facing
//! concurrent index statements are rendered by hand because their exact
//! text is copied into runbooks.
//!
//! - SqlDialect: trait for database-specific SQL generation
//! - Type canonicalisation so introspected and declared types compare equal
//! - Partition DDL for range-partitioned tables

use crate::error::{Error, Result};
use crate::schema::IndexMetadata;
use crate::security::{escape_string_literal, validate_sql_identifier, validate_sql_type_name};
use crate::types::{ColumnMetadata, TableMetadata};
use sea_query::{
    Alias, ColumnDef, Expr, Index, IntoIden, PostgresQueryBuilder, Query, Table, TableRef,
};

fn sea_table_ref(schema: Option<&str>, table: &str) -> TableRef {
    match schema {
        Some(s) => TableRef::SchemaTable(Alias::new(s).into_iden(), Alias::new(table).into_iden()),
        None => TableRef::Table(Alias::new(table).into_iden()),
    }
}

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Get the placeholder for a parameter
    fn placeholder(&self, index: usize) -> String;

    /// SQL listing the columns of a table
    fn list_columns_sql(&self, schema: Option<&str>, table: &str) -> String;

    /// Canonical spelling of a type name, used for type-aware comparison
    fn canonical_type(&self, type_name: &str) -> String;

    /// Native column type for a column definition
    fn native_type(&self, column: &ColumnMetadata) -> String;

    /// `CREATE TABLE IF NOT EXISTS`, optionally range-partitioned on a column
    fn create_table_sql(&self, table: &TableMetadata, partition_by: Option<&str>)
        -> Result<String>;

    /// `DROP TABLE IF EXISTS`
    fn drop_table_sql(&self, schema: Option<&str>, table: &str) -> Result<String>;

    /// `ALTER TABLE .. ADD COLUMN`
    fn add_column_sql(
        &self,
        schema: Option<&str>,
        table: &str,
        column: &ColumnMetadata,
    ) -> Result<String>;

    /// Index creation run as part of (re)building a table
    fn create_index_sql(&self, index: &IndexMetadata) -> Result<String>;

    /// The `CREATE INDEX CONCURRENTLY` line an operator runs by hand
    fn create_index_concurrently_sql(&self, index: &IndexMetadata) -> String;

    /// The `DROP INDEX CONCURRENTLY` line an operator runs by hand
    fn drop_index_concurrently_sql(&self, index_name: &str) -> String;

    /// Parameterised insert of one row
    fn insert_sql(&self, table: &TableMetadata, columns: &[&str]) -> Result<String>;

    /// Parameterised delete matching the given key columns
    fn delete_sql(&self, table: &TableMetadata, key_columns: &[&str]) -> String;

    /// Child partition holding the half-open range `[from, to)`
    fn range_partition_sql(&self, parent: &str, child: &str, from: &str, to: &str)
        -> Result<String>;

    /// Default partition catching rows outside every range
    fn default_partition_sql(&self, parent: &str, child: &str) -> Result<String>;
}

/// PostgreSQL dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    fn sea_column(&self, column: &ColumnMetadata) -> Result<ColumnDef> {
        validate_sql_identifier(&column.name)?;
        let native = self.native_type(column);
        validate_sql_type_name(&native)?;

        let mut def = ColumnDef::new(Alias::new(&column.name));
        def.custom(Alias::new(&native));
        if column.nullable {
            def.null();
        } else {
            def.not_null();
        }
        if let Some(default) = &column.default_value {
            def.default(Expr::cust(default));
        }
        Ok(def)
    }
}

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn list_columns_sql(&self, schema: Option<&str>, table: &str) -> String {
        let schema = escape_string_literal(schema.unwrap_or("public"));
        let table = escape_string_literal(table);
        format!(
            r#"SELECT
                c.column_name,
                CASE WHEN c.data_type = 'ARRAY' THEN ltrim(c.udt_name, '_') || '[]'
                     ELSE c.data_type END AS data_type,
                c.is_nullable = 'YES' AS nullable,
                c.ordinal_position,
                c.column_default,
                c.character_maximum_length,
                CASE WHEN pk.column_name IS NOT NULL THEN pk.ordinal_position END AS pk_ordinal
            FROM information_schema.columns c
            LEFT JOIN (
                SELECT ku.column_name, ku.ordinal_position
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage ku
                    ON tc.constraint_name = ku.constraint_name
                    AND tc.table_schema = ku.table_schema
                    AND tc.table_name = ku.table_name
                WHERE tc.constraint_type = 'PRIMARY KEY'
                    AND tc.table_schema = '{}'
                    AND tc.table_name = '{}'
            ) pk ON c.column_name = pk.column_name
            WHERE c.table_schema = '{}' AND c.table_name = '{}'
            ORDER BY c.ordinal_position"#,
            schema, table, schema, table
        )
    }

    fn canonical_type(&self, type_name: &str) -> String {
        let lowered = type_name.trim().to_lowercase();
        let canonical = match lowered.as_str() {
            "int2" | "smallint" => "smallint",
            "int" | "int4" | "integer" => "integer",
            "int8" | "bigint" => "bigint",
            "float8" | "double precision" | "double" => "double precision",
            "float4" | "real" => "real",
            "bool" | "boolean" => "boolean",
            "varchar" | "character varying" | "string" => "character varying",
            "text" => "text",
            "decimal" | "numeric" => "numeric",
            "timestamp" | "timestamp without time zone" | "datetime" => {
                "timestamp without time zone"
            }
            "timestamptz" | "timestamp with time zone" => "timestamp with time zone",
            "date" => "date",
            "uuid" => "uuid",
            "json" => "json",
            "jsonb" => "jsonb",
            "text[]" | "_text" => "text[]",
            other => return other.to_string(),
        };
        canonical.to_string()
    }

    fn native_type(&self, column: &ColumnMetadata) -> String {
        match self.canonical_type(&column.type_name).as_str() {
            "character varying" => match column.max_length {
                Some(len) => format!("VARCHAR({})", len),
                None => "VARCHAR".to_string(),
            },
            "timestamp without time zone" => "TIMESTAMP".to_string(),
            "timestamp with time zone" => "TIMESTAMPTZ".to_string(),
            other => other.to_uppercase(),
        }
    }

    fn create_table_sql(
        &self,
        table: &TableMetadata,
        partition_by: Option<&str>,
    ) -> Result<String> {
        validate_sql_identifier(&table.name)?;
        if table.columns.is_empty() {
            return Err(Error::schema(format!(
                "table {} has no columns",
                table.qualified_name()
            )));
        }

        let mut stmt = Table::create();
        stmt.table(sea_table_ref(table.schema.as_deref(), &table.name))
            .if_not_exists();

        for column in &table.columns {
            stmt.col(self.sea_column(column)?);
        }

        let pk_columns = table.primary_key_columns();
        if !pk_columns.is_empty() {
            let mut pk = Index::create();
            for column in pk_columns {
                pk.col(Alias::new(&column.name));
            }
            stmt.primary_key(&mut pk);
        }

        let mut sql = stmt.to_string(PostgresQueryBuilder);
        if let Some(column) = partition_by {
            validate_sql_identifier(column)?;
            sql.push_str(&format!(
                " PARTITION BY RANGE ({})",
                self.quote_identifier(column)
            ));
        }
        Ok(sql)
    }

    fn drop_table_sql(&self, schema: Option<&str>, table: &str) -> Result<String> {
        validate_sql_identifier(table)?;
        Ok(Table::drop()
            .table(sea_table_ref(schema, table))
            .if_exists()
            .to_string(PostgresQueryBuilder))
    }

    fn add_column_sql(
        &self,
        schema: Option<&str>,
        table: &str,
        column: &ColumnMetadata,
    ) -> Result<String> {
        validate_sql_identifier(table)?;
        Ok(Table::alter()
            .table(sea_table_ref(schema, table))
            .add_column(self.sea_column(column)?)
            .to_string(PostgresQueryBuilder))
    }

    fn create_index_sql(&self, index: &IndexMetadata) -> Result<String> {
        validate_sql_identifier(&index.name)?;
        validate_sql_identifier(&index.table)?;

        let mut stmt = Index::create();
        stmt.name(&index.name)
            .table(sea_table_ref(index.schema.as_deref(), &index.table))
            .if_not_exists();
        for column in &index.columns {
            validate_sql_identifier(column)?;
            stmt.col(Alias::new(column));
        }
        if index.unique {
            stmt.unique();
        }
        Ok(stmt.to_string(PostgresQueryBuilder))
    }

    fn create_index_concurrently_sql(&self, index: &IndexMetadata) -> String {
        format!(
            "CREATE INDEX CONCURRENTLY {} ON {} ({})",
            self.quote_identifier(&index.name),
            self.quote_identifier(&index.table),
            index.columns.join(", ")
        )
    }

    fn drop_index_concurrently_sql(&self, index_name: &str) -> String {
        format!(
            "DROP INDEX CONCURRENTLY {}",
            self.quote_identifier(index_name)
        )
    }

    fn insert_sql(&self, table: &TableMetadata, columns: &[&str]) -> Result<String> {
        let col_idens: Vec<_> = columns.iter().map(|c| Alias::new(*c).into_iden()).collect();
        let values: Vec<_> = (1..=columns.len())
            .map(|i| Expr::cust(self.placeholder(i)))
            .collect();

        let mut stmt = Query::insert();
        stmt.into_table(sea_table_ref(table.schema.as_deref(), &table.name))
            .columns(col_idens)
            .values(values)
            .map_err(|e| Error::schema(e.to_string()))?;

        Ok(stmt.to_string(PostgresQueryBuilder))
    }

    fn delete_sql(&self, table: &TableMetadata, key_columns: &[&str]) -> String {
        let mut stmt = Query::delete();
        stmt.from_table(sea_table_ref(table.schema.as_deref(), &table.name));
        for (i, col) in key_columns.iter().enumerate() {
            stmt.and_where(Expr::col(Alias::new(*col)).eq(Expr::cust(self.placeholder(i + 1))));
        }

        stmt.to_string(PostgresQueryBuilder)
    }

    fn range_partition_sql(
        &self,
        parent: &str,
        child: &str,
        from: &str,
        to: &str,
    ) -> Result<String> {
        validate_sql_identifier(parent)?;
        validate_sql_identifier(child)?;
        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} PARTITION OF {} FOR VALUES FROM ('{}') TO ('{}')",
            self.quote_identifier(child),
            self.quote_identifier(parent),
            escape_string_literal(from),
            escape_string_literal(to)
        ))
    }

    fn default_partition_sql(&self, parent: &str, child: &str) -> Result<String> {
        validate_sql_identifier(parent)?;
        validate_sql_identifier(child)?;
        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} PARTITION OF {} DEFAULT",
            self.quote_identifier(child),
            self.quote_identifier(parent)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_table() -> TableMetadata {
        let mut table = TableMetadata::new("config_report_demo_cases_0a1b2c3d");
        table
            .columns
            .push(ColumnMetadata::new("doc_id", "text").with_primary_key(1));
        table
            .columns
            .push(ColumnMetadata::new("inserted_at", "timestamp").not_null());
        table.columns.push(ColumnMetadata::new("owner", "text"));
        table
    }

    #[test]
    fn test_postgres_dialect_basics() {
        let dialect = PostgresDialect;
        assert_eq!(dialect.name(), "PostgreSQL");
        assert_eq!(dialect.quote_identifier("t1"), "\"t1\"");
        assert_eq!(dialect.placeholder(3), "$3");
    }

    #[test]
    fn test_canonical_type_aliases() {
        let dialect = PostgresDialect;
        assert_eq!(dialect.canonical_type("int4"), "integer");
        assert_eq!(dialect.canonical_type("TIMESTAMP"), "timestamp without time zone");
        assert_eq!(dialect.canonical_type("_text"), "text[]");
        assert_eq!(dialect.canonical_type("money"), "money");
    }

    #[test]
    fn test_create_table_sql() {
        let sql = PostgresDialect
            .create_table_sql(&report_table(), None)
            .unwrap();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS"));
        assert!(sql.contains("\"doc_id\" TEXT NOT NULL"));
        assert!(sql.contains("\"owner\" TEXT"));
        assert!(sql.contains("PRIMARY KEY (\"doc_id\")"));
    }

    #[test]
    fn test_create_partitioned_table_sql() {
        let sql = PostgresDialect
            .create_table_sql(&report_table(), Some("inserted_at"))
            .unwrap();
        assert!(sql.ends_with("PARTITION BY RANGE (\"inserted_at\")"));
    }

    #[test]
    fn test_add_column_sql() {
        let column = ColumnMetadata::new("district", "text");
        let sql = PostgresDialect
            .add_column_sql(None, "t1", &column)
            .unwrap();
        assert!(sql.starts_with("ALTER TABLE \"t1\" ADD COLUMN \"district\" TEXT"));
    }

    #[test]
    fn test_concurrent_index_lines() {
        let index = IndexMetadata::new(
            "t1",
            "ix_t1_owner",
            vec!["owner".into(), "inserted_at".into()],
        );
        assert_eq!(
            PostgresDialect.create_index_concurrently_sql(&index),
            "CREATE INDEX CONCURRENTLY \"ix_t1_owner\" ON \"t1\" (owner, inserted_at)"
        );
        assert_eq!(
            PostgresDialect.drop_index_concurrently_sql("ix_t1_owner"),
            "DROP INDEX CONCURRENTLY \"ix_t1_owner\""
        );
    }

    #[test]
    fn test_rejects_injected_identifier() {
        let mut table = report_table();
        table.name = "t1; DROP TABLE users".into();
        assert!(PostgresDialect.create_table_sql(&table, None).is_err());
        assert!(PostgresDialect.drop_table_sql(None, &table.name).is_err());
    }
}
