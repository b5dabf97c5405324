//! Shared fixtures for ucr-rebuild integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use ucr_rdbc::prelude::{
    Connection, IndexMetadata, Row, SchemaProvider, TableMetadata, Transaction, Value,
};
use ucr_rdbc::Error as DbError;

use ucr_rebuild::prelude::*;
use ucr_rebuild::rebuild::RebuildJob;

#[derive(Default)]
struct DbState {
    statements: Vec<String>,
    tables: BTreeMap<String, (TableMetadata, Vec<IndexMetadata>)>,
    fail_on: Option<String>,
    missing_table_on: Option<String>,
}

/// In-memory stand-in for one database: records every statement and serves
/// introspection from a table map the test controls
#[derive(Clone, Default)]
pub struct FakeDb {
    state: Arc<Mutex<DbState>>,
}

impl FakeDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a table visible to introspection
    pub fn put_table(&self, table: TableMetadata, indexes: Vec<IndexMetadata>) {
        self.state
            .lock()
            .tables
            .insert(table.name.clone(), (table, indexes));
    }

    /// Deploy the table a configuration currently describes
    pub fn deploy(&self, config: &DataSourceConfig) {
        let definition = DefaultDefinitionProvider.definition(config).unwrap();
        self.put_table(definition.to_table_metadata(), definition.index_metadata());
    }

    /// Fail every statement containing `fragment`
    pub fn fail_on(&self, fragment: &str) {
        self.state.lock().fail_on = Some(fragment.to_string());
    }

    /// Report "table not found" for statements containing `fragment`
    pub fn missing_table_on(&self, fragment: &str) {
        self.state.lock().missing_table_on = Some(fragment.to_string());
    }

    /// Statements executed so far, with BEGIN / COMMIT / ROLLBACK markers
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    /// Statements containing `fragment`
    pub fn statements_matching(&self, fragment: &str) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|s| s.contains(fragment))
            .collect()
    }

    fn run(&self, sql: &str) -> ucr_rdbc::Result<u64> {
        let mut state = self.state.lock();
        if state.fail_on.as_deref().is_some_and(|f| sql.contains(f)) {
            return Err(DbError::query_with_sql("injected failure", sql));
        }
        if let Some(table) = state.missing_table_on.clone() {
            if sql.contains(&table) {
                return Err(DbError::table_not_found(table));
            }
        }
        state.statements.push(sql.to_string());
        Ok(if sql.starts_with("INSERT") { 1 } else { 0 })
    }

    fn mark(&self, marker: &str) {
        self.state.lock().statements.push(marker.to_string());
    }
}

struct FakeTransaction {
    db: FakeDb,
}

#[async_trait]
impl Transaction for FakeTransaction {
    async fn query(&self, _sql: &str, _params: &[Value]) -> ucr_rdbc::Result<Vec<Row>> {
        Ok(vec![])
    }

    async fn execute(&self, sql: &str, _params: &[Value]) -> ucr_rdbc::Result<u64> {
        self.db.run(sql)
    }

    async fn commit(self: Box<Self>) -> ucr_rdbc::Result<()> {
        self.db.mark("COMMIT");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> ucr_rdbc::Result<()> {
        self.db.mark("ROLLBACK");
        Ok(())
    }
}

#[async_trait]
impl Connection for FakeDb {
    async fn query(&self, _sql: &str, _params: &[Value]) -> ucr_rdbc::Result<Vec<Row>> {
        Ok(vec![])
    }

    async fn execute(&self, sql: &str, _params: &[Value]) -> ucr_rdbc::Result<u64> {
        self.run(sql)
    }

    async fn begin(&self) -> ucr_rdbc::Result<Box<dyn Transaction>> {
        self.mark("BEGIN");
        Ok(Box::new(FakeTransaction { db: self.clone() }))
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&self) -> ucr_rdbc::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SchemaProvider for FakeDb {
    async fn list_tables(&self, _schema: Option<&str>) -> ucr_rdbc::Result<Vec<String>> {
        Ok(self.state.lock().tables.keys().cloned().collect())
    }

    async fn get_table(
        &self,
        _schema: Option<&str>,
        table: &str,
    ) -> ucr_rdbc::Result<Option<TableMetadata>> {
        Ok(self.state.lock().tables.get(table).map(|(t, _)| t.clone()))
    }

    async fn list_indexes(
        &self,
        _schema: Option<&str>,
        table: &str,
    ) -> ucr_rdbc::Result<Vec<IndexMetadata>> {
        Ok(self
            .state
            .lock()
            .tables
            .get(table)
            .map(|(_, ix)| ix.clone())
            .unwrap_or_default())
    }
}

/// Connection manager with one fake engine registered as `default`
pub fn connections(db: &FakeDb) -> Arc<ConnectionManager> {
    let mut manager = ConnectionManager::new();
    manager.register_with_provider("default", Arc::new(db.clone()), Arc::new(db.clone()));
    Arc::new(manager)
}

/// Case data source with an `owner` column
pub fn cases_config(id: &str, domain: &str) -> DataSourceConfig {
    DataSourceConfig::new(id, domain, "cases")
        .with_column(ColumnDef::new("owner", Datatype::String))
        .with_column(ColumnDef::new("visits", Datatype::Integer))
}

/// Case document
pub fn case_doc(id: &str, domain: &str, owner: &str) -> Document {
    Document::new(id, domain, "CommCareCase", json!({"owner": owner, "visits": 3}))
}

/// Adapter factory over the fake engine
pub fn factory(db: &FakeDb) -> Arc<AdapterFactory> {
    Arc::new(AdapterFactory::new(
        connections(db),
        Arc::new(DefaultDefinitionProvider),
        Arc::new(JsonFieldProducer),
    ))
}

/// Alert sink that keeps what it receives
#[derive(Default)]
pub struct RecordingAlerts {
    pub alerts: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingAlerts {
    pub fn messages(&self) -> Vec<String> {
        self.alerts.lock().iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }
}

impl AlertSink for RecordingAlerts {
    fn notify(&self, message: &str, context: serde_json::Value) {
        self.alerts.lock().push((message.to_string(), context));
    }
}

/// Rebuild queue that keeps jobs in memory
#[derive(Default)]
pub struct RecordingQueue {
    pub jobs: Mutex<Vec<RebuildJob>>,
}

impl RecordingQueue {
    pub fn tables(&self) -> Vec<String> {
        self.jobs.lock().iter().map(|j| j.table.clone()).collect()
    }
}

#[async_trait]
impl RebuildQueue for RecordingQueue {
    async fn enqueue(&self, job: RebuildJob) -> Result<()> {
        self.jobs.lock().push(job);
        Ok(())
    }
}

/// Everything a reconciliation test needs, wired over in-memory parts
pub struct Harness {
    pub db: FakeDb,
    pub catalog: Arc<MemoryConfigStore>,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<RecordingQueue>,
    pub tracker: Arc<JobTracker>,
    pub alerts: Arc<RecordingAlerts>,
    pub audit: Arc<StoreAuditLog>,
    pub factory: Arc<AdapterFactory>,
    pub orchestrator: Arc<RebuildOrchestrator>,
}

impl Harness {
    pub fn new(configs: Vec<DataSourceConfig>) -> Self {
        let db = FakeDb::new();
        let catalog = Arc::new(MemoryConfigStore::with_configs(configs));
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(RecordingQueue::default());
        let tracker = Arc::new(JobTracker::new());
        let alerts = Arc::new(RecordingAlerts::default());
        let audit = Arc::new(StoreAuditLog::new(store.clone()));
        let factory = factory(&db);

        let rebuilder = TableRebuilder::new(catalog.clone(), queue.clone(), tracker.clone())
            .with_audit(audit.clone());
        let orchestrator = Arc::new(RebuildOrchestrator::new(
            catalog.clone(),
            connections(&db),
            rebuilder,
            audit.clone(),
            alerts.clone(),
        ));

        Self {
            db,
            catalog,
            store,
            queue,
            tracker,
            alerts,
            audit,
            factory,
            orchestrator,
        }
    }

    /// Adapter for the catalog's current copy of a configuration
    pub async fn adapter(&self, id: &str) -> Arc<dyn IndicatorAdapter> {
        let config = self.catalog.get(id).await.unwrap().unwrap();
        self.factory.build(&config).unwrap()
    }
}
