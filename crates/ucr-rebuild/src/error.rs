//! Error types for table reconciliation
//!
//! Errors carry enough classification to decide between "skip and retry on
//! the next pass", "alert an operator" and "drop the adapter until the next
//! bootstrap".

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for reconciliation operations
pub type Result<T> = std::result::Result<T, RebuildError>;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration changed underneath the operation
    Stale,
    /// DDL or data load failure while rebuilding
    Rebuild,
    /// Invalid data source or worker configuration
    Configuration,
    /// Database errors outside a rebuild
    Database,
    /// Shared cache / list store failures
    Store,
    /// Document-level problems reported by a row producer
    Indicator,
    /// Other/unknown errors
    Other,
}

/// Reconciliation errors
#[derive(Error, Debug)]
pub enum RebuildError {
    /// The in-memory configuration revision is behind the persisted one
    #[error("stale rebuild of {config_id}: have revision {current}, latest is {latest}")]
    StaleRebuild {
        /// Data source id
        config_id: String,
        /// Revision the caller was holding
        current: String,
        /// Revision found in storage
        latest: String,
    },

    /// A DDL or load step of a rebuild failed
    #[error("rebuild of table {table} failed: {message}")]
    TableRebuild {
        /// Physical table name
        table: String,
        /// Failure description
        message: String,
    },

    /// The data source definition is unusable
    #[error("invalid data source: {0}")]
    BadSpec(String),

    /// Worker configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// No connection registered for an engine id
    #[error("unknown engine: {0}")]
    UnknownEngine(String),

    /// Data source no longer exists
    #[error("data source not found: {0}")]
    NotFound(String),

    /// Shared cache or list store failure
    #[error("store error: {0}")]
    Store(String),

    /// The rebuild queue has no consumer left
    #[error("rebuild queue closed")]
    QueueClosed,

    /// A row producer rejected a document; the adapter is paused
    #[error("indicator warning: {0}")]
    Warning(String),

    /// Database error
    #[error(transparent)]
    Database(#[from] ucr_rdbc::Error),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RebuildError {
    /// Create a table rebuild error
    pub fn table_rebuild(table: impl Into<String>, message: impl ToString) -> Self {
        Self::TableRebuild {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Create a bad-spec error
    pub fn bad_spec(msg: impl Into<String>) -> Self {
        Self::BadSpec(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create an indicator warning
    pub fn warning(msg: impl Into<String>) -> Self {
        Self::Warning(msg.into())
    }

    /// Check if the error is worth retrying on a later pass
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::StaleRebuild { .. } | Self::Store(_) => true,
            Self::Database(e) => e.is_retriable(),
            _ => false,
        }
    }

    /// Whether the write target was missing, e.g. mid-rebuild
    pub fn is_table_missing(&self) -> bool {
        matches!(self, Self::Database(e) if e.is_table_missing())
    }

    /// Get the error category for metrics/alerting
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::StaleRebuild { .. } => ErrorCategory::Stale,
            Self::TableRebuild { .. } => ErrorCategory::Rebuild,
            Self::BadSpec(_) | Self::Config(_) | Self::UnknownEngine(_) => {
                ErrorCategory::Configuration
            }
            Self::Database(_) => ErrorCategory::Database,
            Self::Store(_) | Self::QueueClosed => ErrorCategory::Store,
            Self::Warning(_) => ErrorCategory::Indicator,
            Self::NotFound(_) | Self::Json(_) => ErrorCategory::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_is_retriable() {
        let err = RebuildError::StaleRebuild {
            config_id: "abc".into(),
            current: "1-a".into(),
            latest: "2-b".into(),
        };
        assert!(err.is_retriable());
        assert_eq!(err.category(), ErrorCategory::Stale);
        assert!(err.to_string().contains("2-b"));
    }

    #[test]
    fn test_table_missing_passthrough() {
        let err = RebuildError::from(ucr_rdbc::Error::table_not_found("t1"));
        assert!(err.is_table_missing());
        assert!(!RebuildError::bad_spec("no columns").is_table_missing());
    }

    #[test]
    fn test_rebuild_not_retriable() {
        let err = RebuildError::table_rebuild("t1", "lock conflict");
        assert!(!err.is_retriable());
        assert_eq!(err.category(), ErrorCategory::Rebuild);
    }
}
