//! Engine registry
//!
//! Maps an engine id to the long-lived connection (and schema provider) of
//! that database. Built once at startup and handed to every component that
//! needs a connection.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use ucr_rdbc::connection::{ConnectionConfig, ConnectionFactory};
use ucr_rdbc::schema::{PgSchemaProvider, SchemaProvider};
use ucr_rdbc::Connection;

use crate::error::{RebuildError, Result};

/// Connection and introspection for one engine
#[derive(Clone)]
pub struct EngineHandle {
    /// Engine id
    pub engine_id: String,
    /// Shared connection
    pub connection: Arc<dyn Connection>,
    /// Live schema introspection on the same database
    pub schema: Arc<dyn SchemaProvider>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("engine_id", &self.engine_id)
            .finish_non_exhaustive()
    }
}

/// Registry of engines by id
#[derive(Default)]
pub struct ConnectionManager {
    engines: BTreeMap<String, EngineHandle>,
}

impl ConnectionManager {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection per `engine id -> url` entry
    pub async fn connect_all(
        engines: &BTreeMap<String, String>,
        factory: &dyn ConnectionFactory,
    ) -> Result<Self> {
        let mut manager = Self::new();
        for (engine_id, url) in engines {
            let conn: Arc<dyn Connection> = Arc::from(
                factory
                    .connect(&ConnectionConfig::new(url).with_application_name("ucr-rebuild"))
                    .await?,
            );
            info!(engine = %engine_id, "connected engine");
            manager.register(engine_id.clone(), conn);
        }
        Ok(manager)
    }

    /// Register a PostgreSQL engine
    pub fn register(&mut self, engine_id: impl Into<String>, connection: Arc<dyn Connection>) {
        let schema = Arc::new(PgSchemaProvider::new(Arc::clone(&connection)));
        self.register_with_provider(engine_id, connection, schema);
    }

    /// Register an engine with its own schema provider
    pub fn register_with_provider(
        &mut self,
        engine_id: impl Into<String>,
        connection: Arc<dyn Connection>,
        schema: Arc<dyn SchemaProvider>,
    ) {
        let engine_id = engine_id.into();
        self.engines.insert(
            engine_id.clone(),
            EngineHandle {
                engine_id,
                connection,
                schema,
            },
        );
    }

    /// Look up an engine
    pub fn get(&self, engine_id: &str) -> Result<EngineHandle> {
        self.engines
            .get(engine_id)
            .cloned()
            .ok_or_else(|| RebuildError::UnknownEngine(engine_id.to_string()))
    }

    /// Registered engine ids
    pub fn engine_ids(&self) -> impl Iterator<Item = &str> {
        self.engines.keys().map(String::as_str)
    }

    /// Close every connection
    pub async fn close_all(&self) -> Result<()> {
        for handle in self.engines.values() {
            handle.connection.close().await?;
        }
        Ok(())
    }
}
