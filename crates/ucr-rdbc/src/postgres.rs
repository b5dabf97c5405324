//! PostgreSQL backend implementation for ucr-rdbc
//!
//! - Connection over a single tokio-postgres client
//! - Transactions that hold the connection's session for their lifetime,
//!   so statements from other tasks never interleave with an open transaction
//! - Error mapping (missing relation, lock timeouts) onto [`Error`]

use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tracing::{debug, error, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, Transaction};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// NULL parameter accepted for any column type
#[derive(Debug)]
struct SqlNull;

impl ToSql for SqlNull {
    fn to_sql(
        &self,
        _ty: &Type,
        _out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        Ok(IsNull::Yes)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn value_to_sql(value: &Value) -> Box<dyn ToSql + Sync + Send> {
    match value {
        Value::Null => Box::new(SqlNull),
        Value::Bool(b) => Box::new(*b),
        Value::Int16(n) => Box::new(*n),
        Value::Int32(n) => Box::new(*n),
        Value::Int64(n) => Box::new(*n),
        Value::Float64(n) => Box::new(*n),
        Value::Decimal(d) => Box::new(*d),
        Value::String(s) => Box::new(s.clone()),
        Value::Date(d) => Box::new(*d),
        Value::DateTime(dt) => Box::new(*dt),
        Value::DateTimeTz(dt) => Box::new(*dt),
        Value::Uuid(u) => Box::new(*u),
        Value::Json(j) => Box::new(j.clone()),
        Value::Array(items) => Box::new(items.clone()),
    }
}

fn bind(params: &[Value]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    params.iter().map(value_to_sql).collect()
}

fn as_refs(boxed: &[Box<dyn ToSql + Sync + Send>]) -> Vec<&(dyn ToSql + Sync)> {
    boxed
        .iter()
        .map(|b| b.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Row {
    let columns = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let values = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect();
    Row::new(columns, values)
}

fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Value {
    fn get<'a, T: tokio_postgres::types::FromSql<'a>>(
        row: &'a tokio_postgres::Row,
        idx: usize,
    ) -> Option<T> {
        row.try_get::<_, Option<T>>(idx).ok().flatten()
    }

    let value = match *pg_type {
        Type::BOOL => get::<bool>(row, idx).map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx).map(Value::Int16),
        Type::INT4 => get::<i32>(row, idx).map(Value::Int32),
        Type::INT8 => get::<i64>(row, idx).map(Value::Int64),
        Type::FLOAT4 => get::<f32>(row, idx).map(|f| Value::Float64(f64::from(f))),
        Type::FLOAT8 => get::<f64>(row, idx).map(Value::Float64),
        Type::NUMERIC => get::<rust_decimal::Decimal>(row, idx).map(Value::Decimal),
        Type::DATE => get::<chrono::NaiveDate>(row, idx).map(Value::Date),
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx).map(Value::DateTime),
        Type::TIMESTAMPTZ => {
            get::<chrono::DateTime<chrono::Utc>>(row, idx).map(Value::DateTimeTz)
        }
        Type::UUID => get::<uuid::Uuid>(row, idx).map(Value::Uuid),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx).map(Value::Json),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => get::<Vec<String>>(row, idx).map(Value::Array),
        _ => get::<String>(row, idx).map(Value::String),
    };
    value.unwrap_or(Value::Null)
}

fn map_pg_error(e: tokio_postgres::Error, sql: &str) -> Error {
    if let Some(db) = e.as_db_error() {
        let code = db.code();
        if *code == SqlState::UNDEFINED_TABLE {
            return Error::table_not_found(db.message());
        }
        if *code == SqlState::LOCK_NOT_AVAILABLE || *code == SqlState::QUERY_CANCELED {
            return Error::timeout(db.message());
        }
    }
    if e.is_closed() {
        return Error::connection_with_source("connection closed", e);
    }
    Error::query_with_sql(e.to_string(), sql)
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: Arc<tokio_postgres::Client>,
    session: Arc<Mutex<()>>,
    closed: AtomicBool,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client: Arc::new(client),
            session: Arc::new(Mutex::new(())),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        let boxed = bind(params);
        let _session = self.session.lock().await;
        let pg_rows = self
            .client
            .query(sql, &as_refs(&boxed))
            .await
            .map_err(|e| map_pg_error(e, sql))?;
        Ok(pg_rows.iter().map(pg_row_to_row).collect())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        let boxed = bind(params);
        let _session = self.session.lock().await;
        self.client
            .execute(sql, &as_refs(&boxed))
            .await
            .map_err(|e| map_pg_error(e, sql))
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;
        let guard = Arc::clone(&self.session).lock_owned().await;

        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| Error::Transaction {
                message: e.to_string(),
                source: Some(Box::new(e)),
            })?;

        Ok(Box::new(PgTransaction {
            client: Arc::clone(&self.client),
            finished: AtomicBool::new(false),
            session: Some(guard),
        }))
    }

    async fn is_valid(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// PostgreSQL transaction
pub struct PgTransaction {
    client: Arc<tokio_postgres::Client>,
    finished: AtomicBool,
    session: Option<OwnedMutexGuard<()>>,
}

impl PgTransaction {
    async fn finish(&self, statement: &str) -> Result<()> {
        self.client
            .batch_execute(statement)
            .await
            .map_err(|e| Error::Transaction {
                message: e.to_string(),
                source: Some(Box::new(e)),
            })?;
        self.finished.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let boxed = bind(params);
        let pg_rows = self
            .client
            .query(sql, &as_refs(&boxed))
            .await
            .map_err(|e| map_pg_error(e, sql))?;
        Ok(pg_rows.iter().map(pg_row_to_row).collect())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let boxed = bind(params);
        self.client
            .execute(sql, &as_refs(&boxed))
            .await
            .map_err(|e| map_pg_error(e, sql))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if self.finished.load(Ordering::Relaxed) {
            return;
        }
        // Abandoned transaction: roll back before the session is reused
        warn!("transaction dropped without commit or rollback, rolling back");
        let client = Arc::clone(&self.client);
        // The session stays locked until the ROLLBACK has run
        let session = self.session.take();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = client.batch_execute("ROLLBACK").await {
                    error!("rollback of abandoned transaction failed: {}", e);
                }
                drop(session);
            });
        }
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut pg_config: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e| Error::config(format!("invalid connection url: {}", e)))?;
        pg_config.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        if let Some(name) = &config.application_name {
            pg_config.application_name(name);
        }

        let (client, connection) = pg_config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("postgres connection error: {}", e);
            }
        });

        if config.statement_timeout_ms > 0 {
            let sql = format!("SET statement_timeout = {}", config.statement_timeout_ms);
            client
                .batch_execute(&sql)
                .await
                .map_err(|e| map_pg_error(e, &sql))?;
        }

        debug!(?config, "opened postgres connection");
        Ok(Box::new(PgConnection::new(client)))
    }
}

/// Connect to a PostgreSQL database
pub async fn connect(url: &str) -> Result<Box<dyn Connection>> {
    PgConnectionFactory
        .connect(&ConnectionConfig::new(url))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_accepts_any_type() {
        assert!(<SqlNull as ToSql>::accepts(&Type::TEXT));
        assert!(<SqlNull as ToSql>::accepts(&Type::TIMESTAMP));
    }

    #[test]
    fn test_value_binding() {
        let boxed = bind(&[
            Value::Int32(42),
            Value::String("hello".into()),
            Value::Null,
            Value::Array(vec!["a".into()]),
        ]);
        assert_eq!(as_refs(&boxed).len(), 4);
    }

    #[tokio::test]
    async fn test_factory_rejects_bad_url() {
        let err = PgConnectionFactory
            .connect(&ConnectionConfig::new("not a url ::"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.category(), crate::error::ErrorCategory::Configuration);
    }
}
