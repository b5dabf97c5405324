//! Shared key-value stores used across worker processes
//!
//! Two contracts:
//! - [`SharedCache`]: string values with a TTL and an atomic add-if-absent,
//!   backing the task coordinator
//! - [`ListStore`]: append-only string lists, backing resume checkpoints and
//!   audit trails
//!
//! [`MemoryStore`] implements both for a single process (and tests);
//! [`PgStore`] implements both on a metadata PostgreSQL database so that
//! every worker sees the same state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use ucr_rdbc::{Connection, Value};

use crate::clock::{chrono_duration, Clock, SystemClock};
use crate::error::{RebuildError, Result};

/// Cache shared by all workers
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Store `value` under `key` only if no live entry exists.
    ///
    /// Returns `true` when this call created the entry. Must be atomic
    /// across processes.
    async fn add(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Read a live entry
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove an entry (no-op when absent)
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Ordered, append-only lists shared by all workers
#[async_trait]
pub trait ListStore: Send + Sync {
    /// Append a value to the end of the list
    async fn push(&self, key: &str, value: &str) -> Result<()>;

    /// Read the whole list in insertion order
    async fn range(&self, key: &str) -> Result<Vec<String>>;

    /// Remove the list
    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// In-process store; expiry is evaluated against the injected clock
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    lists: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryStore {
    /// Create a store on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store on a custom clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            cache: Mutex::new(HashMap::new()),
            lists: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live cache entries
    pub fn cache_len(&self) -> usize {
        let now = self.clock.now();
        self.cache
            .lock()
            .values()
            .filter(|e| e.expires_at.map_or(true, |at| at > now))
            .count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedCache for MemoryStore {
    async fn add(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get(key) {
            if entry.expires_at.map_or(true, |at| at > now) {
                return Ok(false);
            }
        }
        let expires_at = if ttl.is_zero() {
            None
        } else {
            now.checked_add_signed(chrono_duration(ttl))
        };
        cache.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let mut cache = self.cache.lock();
        match cache.get(key) {
            Some(entry) if entry.expires_at.map_or(true, |at| at > now) => {
                Ok(Some(entry.value.clone()))
            }
            Some(_) => {
                cache.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.cache.lock().remove(key);
        Ok(())
    }
}

#[async_trait]
impl ListStore for MemoryStore {
    async fn push(&self, key: &str, value: &str) -> Result<()> {
        self.lists
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
        Ok(())
    }

    async fn range(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.lists.lock().get(key).cloned().unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lists.lock().remove(key);
        Ok(())
    }
}

/// Store on a metadata PostgreSQL database.
///
/// Expiry uses the database clock so that workers with skewed clocks agree.
///
/// # Table Schema
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS ucr_shared_cache (
///     key TEXT PRIMARY KEY,
///     value TEXT NOT NULL,
///     expires_at TIMESTAMPTZ
/// );
/// CREATE TABLE IF NOT EXISTS ucr_shared_list (
///     id BIGSERIAL PRIMARY KEY,
///     key TEXT NOT NULL,
///     value TEXT NOT NULL
/// );
/// ```
pub struct PgStore {
    conn: Arc<dyn Connection>,
    cache_table: String,
    list_table: String,
}

impl PgStore {
    /// Create the store, creating its tables if needed
    pub async fn new(conn: Arc<dyn Connection>, table_prefix: Option<&str>) -> Result<Self> {
        let prefix = table_prefix.unwrap_or("ucr_shared");
        ucr_rdbc::security::validate_sql_identifier(prefix)?;

        let store = Self {
            conn,
            cache_table: format!("{}_cache", prefix),
            list_table: format!("{}_list", prefix),
        };
        store.ensure_tables().await?;
        Ok(store)
    }

    async fn ensure_tables(&self) -> Result<()> {
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                    key TEXT PRIMARY KEY, \
                    value TEXT NOT NULL, \
                    expires_at TIMESTAMPTZ)",
                self.cache_table
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                    id BIGSERIAL PRIMARY KEY, \
                    key TEXT NOT NULL, \
                    value TEXT NOT NULL)",
                self.list_table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {0}_key_idx ON {0} (key, id)",
                self.list_table
            ),
        ];

        for sql in &statements {
            self.conn
                .execute(sql, &[])
                .await
                .map_err(|e| RebuildError::store(format!("failed to create store table: {}", e)))?;
        }
        debug!(cache = %self.cache_table, list = %self.list_table, "shared store ready");
        Ok(())
    }
}

#[async_trait]
impl SharedCache for PgStore {
    async fn add(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        // The conflict branch only fires for expired rows, so a live entry
        // makes this affect zero rows.
        let sql = format!(
            "INSERT INTO {0} (key, value, expires_at) \
             VALUES ($1, $2, CASE WHEN $3::bigint > 0 \
                 THEN now() + $3::bigint * interval '1 millisecond' END) \
             ON CONFLICT (key) DO UPDATE SET \
                 value = EXCLUDED.value, \
                 expires_at = EXCLUDED.expires_at \
             WHERE {0}.expires_at IS NOT NULL AND {0}.expires_at <= now()",
            self.cache_table
        );
        let affected = self
            .conn
            .execute(
                &sql,
                &[
                    Value::from(key),
                    Value::from(value),
                    Value::Int64(ttl.as_millis() as i64),
                ],
            )
            .await?;
        Ok(affected == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT value FROM {} WHERE key = $1 \
             AND (expires_at IS NULL OR expires_at > now())",
            self.cache_table
        );
        let row = self.conn.query_one(&sql, &[Value::from(key)]).await?;
        Ok(row.and_then(|r| r.get_by_name("value").and_then(|v| v.as_str().map(String::from))))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE key = $1", self.cache_table);
        self.conn.execute(&sql, &[Value::from(key)]).await?;
        Ok(())
    }
}

#[async_trait]
impl ListStore for PgStore {
    async fn push(&self, key: &str, value: &str) -> Result<()> {
        let sql = format!("INSERT INTO {} (key, value) VALUES ($1, $2)", self.list_table);
        self.conn
            .execute(&sql, &[Value::from(key), Value::from(value)])
            .await?;
        Ok(())
    }

    async fn range(&self, key: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT value FROM {} WHERE key = $1 ORDER BY id",
            self.list_table
        );
        let rows = self.conn.query(&sql, &[Value::from(key)]).await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.get_by_name("value").and_then(|v| v.as_str().map(String::from)))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE key = $1", self.list_table);
        self.conn.execute(&sql, &[Value::from(key)]).await?;
        Ok(())
    }
}
