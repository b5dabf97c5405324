//! Integration tests for catalog-backed schema discovery

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use ucr_rdbc::prelude::*;

/// Connection returning canned rows, keyed on a fragment of the SQL text
struct CannedConnection {
    responses: Vec<(&'static str, Vec<Row>)>,
    queries: Mutex<Vec<String>>,
}

#[async_trait]
impl Connection for CannedConnection {
    async fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        self.queries.lock().push(sql.to_string());
        Ok(self
            .responses
            .iter()
            .find(|(fragment, _)| sql.contains(fragment))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<u64> {
        Ok(0)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Err(Error::unsupported("read-only test connection"))
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn column_row(name: &str, data_type: &str, nullable: bool, pk: Option<i32>) -> Row {
    Row::from_pairs([
        ("column_name", Value::from(name)),
        ("data_type", Value::from(data_type)),
        ("nullable", Value::Bool(nullable)),
        ("ordinal_position", Value::Int32(1)),
        ("column_default", Value::Null),
        ("character_maximum_length", Value::Null),
        ("pk_ordinal", Value::from(pk)),
    ])
}

fn index_row(index: &str, column: &str, primary: bool) -> Row {
    Row::from_pairs([
        ("index_name", Value::from(index)),
        ("column_name", Value::from(column)),
        ("is_unique", Value::Bool(primary)),
        ("is_primary", Value::Bool(primary)),
    ])
}

#[tokio::test]
async fn test_get_table_reads_columns() {
    let conn = Arc::new(CannedConnection {
        responses: vec![(
            "information_schema.columns",
            vec![
                column_row("doc_id", "text", false, Some(1)),
                column_row("owner", "text", true, None),
            ],
        )],
        queries: Mutex::new(vec![]),
    });
    let provider = PgSchemaProvider::new(conn.clone());

    let table = provider.get_table(None, "t1").await.unwrap().unwrap();
    assert_eq!(table.schema.as_deref(), Some("public"));
    assert_eq!(table.column_names(), vec!["doc_id", "owner"]);
    assert_eq!(table.primary_key_columns()[0].name, "doc_id");
    assert!(provider.table_exists(None, "t1").await.unwrap());
}

#[tokio::test]
async fn test_missing_table_is_none() {
    let conn = Arc::new(CannedConnection {
        responses: vec![],
        queries: Mutex::new(vec![]),
    });
    let provider = PgSchemaProvider::new(conn);

    assert!(provider.get_table(None, "absent").await.unwrap().is_none());
    assert!(!provider.table_exists(None, "absent").await.unwrap());
}

#[tokio::test]
async fn test_list_indexes_groups_columns() {
    let conn = Arc::new(CannedConnection {
        responses: vec![(
            "pg_index",
            vec![
                index_row("ix_t1_owner_date", "owner", false),
                index_row("ix_t1_owner_date", "visit_date", false),
                index_row("t1_pkey", "doc_id", true),
            ],
        )],
        queries: Mutex::new(vec![]),
    });
    let provider = PgSchemaProvider::new(conn);

    let indexes = provider.list_indexes(None, "t1").await.unwrap();
    assert_eq!(indexes.len(), 2);
    assert_eq!(indexes[0].name, "ix_t1_owner_date");
    assert_eq!(indexes[0].columns, vec!["owner", "visit_date"]);
    assert!(indexes[1].primary);
}
