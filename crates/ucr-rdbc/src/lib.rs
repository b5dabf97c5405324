//! # ucr-rdbc
//!
//! Relational connectivity for report tables: the connection abstraction,
//! the statements the reconciliation engine issues, and introspection of
//! what is actually deployed.
//!
//! ## Features
//!
//! - **Connection traits**: async `Connection` / `Transaction` over any backend
//! - **DDL generation**: create/drop/alter statements via sea-query, plus the
//!   exact `CREATE INDEX CONCURRENTLY` / `DROP INDEX CONCURRENTLY` lines that
//!   operators run by hand
//! - **Type canonicalisation**: `int4` and `integer` compare equal, `varchar`
//!   and `text` do not
//! - **Schema discovery**: live columns, primary keys and indexes from the
//!   PostgreSQL catalog
//! - **Identifier guards**: validation before anything is quoted into DDL
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ucr_rdbc::prelude::*;
//!
//! let conn: Arc<dyn Connection> = Arc::from(ucr_rdbc::postgres::connect(url).await?);
//! let provider = PgSchemaProvider::new(Arc::clone(&conn));
//! let live = provider.get_table(None, "config_report_demo_cases_1a2b3c4d").await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` (default) - PostgreSQL backend via tokio-postgres

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod connection;
pub mod dialect;
pub mod error;
pub mod schema;
pub mod security;
pub mod types;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, Transaction};
    pub use crate::dialect::{PostgresDialect, SqlDialect};
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::schema::{IndexMetadata, PgSchemaProvider, SchemaProvider};
    pub use crate::types::{ColumnMetadata, Row, TableMetadata, Value};
}

pub use connection::{Connection, Transaction};
pub use error::{Error, Result};
pub use types::Value;

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let _value = Value::Int32(42);
        let _config = ConnectionConfig::new("postgres://localhost/ucr");
        let _dialect: &dyn SqlDialect = &PostgresDialect;
    }

    #[test]
    fn test_root_reexports() {
        fn takes(_conn: Option<&dyn crate::Connection>, _tx: Option<&dyn crate::Transaction>) {}
        takes(None, None);
        let _value = crate::Value::Null;
    }

    #[test]
    fn test_error_types() {
        let err = Error::connection("refused");
        assert!(err.is_retriable());
        assert_eq!(err.category(), ErrorCategory::Connection);
    }
}
