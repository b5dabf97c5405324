//! # Reconciliation pass
//!
//! [`RebuildOrchestrator::reconcile`] brings every live table in line with
//! its data source definition:
//!
//! 1. Drop adapters whose configuration was deleted or deactivated, checked
//!    against the [`ConfigStore`] rather than the copy the adapter holds.
//! 2. Group the remaining relational adapters by engine.
//! 3. Per engine, diff all tables in one introspection pass and classify.
//! 4. Hand each table to rebuild to the [`TableRebuilder`], then migrate the
//!    rest through the [`TableMigrator`] and record what was applied in the
//!    configuration's audit trail.
//!
//! A failure on one table or engine is reported through the [`AlertSink`]
//! and never aborts the pass.

use metrics::{Counter, Histogram};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapter::IndicatorAdapter;
use crate::audit::{AuditEntry, AuditLog};
use crate::catalog::ConfigStore;
use crate::classify::{MigrationClassifier, MigrationPlan};
use crate::connections::{ConnectionManager, EngineHandle};
use crate::diff::{DiffSummary, ExpectedSchema, SchemaDiff, SchemaDiffEngine};
use crate::error::{ErrorCategory, RebuildError, Result};
use crate::migrate::{AppliedDiffs, TableMigrator};
use crate::notify::AlertSink;
use crate::rebuild::{RebuildDecision, TableRebuilder, DEFAULT_SOURCE};

type AdapterRef = Arc<dyn IndicatorAdapter>;

/// Reconciliation metrics
pub struct ReconcileMetrics {
    /// Passes run
    pub passes: Counter,
    /// Rebuild jobs enqueued
    pub rebuilds_queued: Counter,
    /// Tables migrated in place
    pub migrations: Counter,
    /// Table or engine failures
    pub errors: Counter,
    /// Pass duration
    pub duration: Histogram,
}

impl ReconcileMetrics {
    /// Register the reconciliation metrics
    pub fn new() -> Self {
        Self {
            passes: metrics::counter!("ucr_reconcile_passes_total"),
            rebuilds_queued: metrics::counter!("ucr_reconcile_rebuilds_queued_total"),
            migrations: metrics::counter!("ucr_reconcile_migrations_total"),
            errors: metrics::counter!("ucr_reconcile_errors_total"),
            duration: metrics::histogram!("ucr_reconcile_duration_seconds"),
        }
    }
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A table-level failure during a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileFailure {
    /// Engine the failure happened on
    pub engine_id: String,
    /// Table, when the failure is table-specific
    pub table: Option<String>,
    /// Error text
    pub error: String,
    /// Kind of failure
    pub category: ErrorCategory,
    /// Whether the next pass may succeed without intervention
    pub retriable: bool,
}

/// What a reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Engines visited
    pub engines: usize,
    /// Tables diffed
    pub tables: usize,
    /// Configurations dropped as deleted or deactivated
    pub inactive: Vec<String>,
    /// Rebuild jobs enqueued, by table
    pub rebuilds_queued: BTreeMap<String, Uuid>,
    /// Rebuilds skipped because destructive rebuilds are disabled
    pub rebuilds_skipped: Vec<String>,
    /// Rebuilds refused because the configuration changed
    pub stale: Vec<String>,
    /// Migrations applied (index changes: logged for an operator)
    pub migrated: AppliedDiffs,
    /// Failures reported through the alert sink
    pub failures: Vec<ReconcileFailure>,
}

impl ReconcileReport {
    /// Whether anything failed
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Dry-run result for one engine
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnginePlan {
    /// Engine id
    pub engine_id: String,
    /// Tables that would be rebuilt
    pub rebuild: BTreeMap<String, Vec<DiffSummary>>,
    /// Tables that would be migrated
    pub migrate: BTreeMap<String, Vec<DiffSummary>>,
    /// Statements an operator would have to run by hand
    pub operator_statements: Vec<String>,
    /// The typed plan
    #[serde(skip)]
    pub plan: MigrationPlan,
}

fn summarize(diffs: &BTreeMap<String, Vec<SchemaDiff>>) -> BTreeMap<String, Vec<DiffSummary>> {
    diffs
        .iter()
        .map(|(table, diffs)| (table.clone(), diffs.iter().map(SchemaDiff::summary).collect()))
        .collect()
}

/// Adapters per engine, keyed by physical table name
type EngineTables = BTreeMap<String, BTreeMap<String, AdapterRef>>;

/// Runs reconciliation passes
pub struct RebuildOrchestrator {
    catalog: Arc<dyn ConfigStore>,
    connections: Arc<ConnectionManager>,
    classifier: MigrationClassifier,
    migrator: TableMigrator,
    rebuilder: TableRebuilder,
    audit: Arc<dyn AuditLog>,
    alerts: Arc<dyn AlertSink>,
    metrics: ReconcileMetrics,
    source: String,
}

impl RebuildOrchestrator {
    /// Create an orchestrator with the default classifier and migrator
    pub fn new(
        catalog: Arc<dyn ConfigStore>,
        connections: Arc<ConnectionManager>,
        rebuilder: TableRebuilder,
        audit: Arc<dyn AuditLog>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            catalog,
            connections,
            classifier: MigrationClassifier::new(),
            migrator: TableMigrator::new(),
            rebuilder,
            audit,
            alerts,
            metrics: ReconcileMetrics::new(),
            source: DEFAULT_SOURCE.to_string(),
        }
    }

    /// Use a custom classifier
    pub fn with_classifier(mut self, classifier: MigrationClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Use a custom migrator
    pub fn with_migrator(mut self, migrator: TableMigrator) -> Self {
        self.migrator = migrator;
        self
    }

    /// Origin tag for audit entries
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// The rebuilder
    pub fn rebuilder(&self) -> &TableRebuilder {
        &self.rebuilder
    }

    /// Run one reconciliation pass
    #[instrument(skip(self, adapters), fields(adapters = adapters.len()))]
    pub async fn reconcile(&self, adapters: &[AdapterRef]) -> ReconcileReport {
        let started = Instant::now();
        self.metrics.passes.increment(1);
        let mut report = ReconcileReport::default();

        let mut active = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            match self.is_active(adapter.as_ref()).await {
                Ok(true) => active.push(Arc::clone(adapter)),
                Ok(false) => report.inactive.push(adapter.config().id.clone()),
                Err(e) => self.fail(&mut report, adapter.engine_id(), Some(adapter.as_ref()), &e),
            }
        }

        let engines = group_by_engine(active);
        report.engines = engines.len();
        for (engine_id, tables) in engines {
            report.tables += tables.len();
            let handle = match self.connections.get(&engine_id) {
                Ok(handle) => handle,
                Err(e) => {
                    self.fail(&mut report, &engine_id, None, &e);
                    continue;
                }
            };
            let plan = match self.classify_engine(&handle, &tables).await {
                Ok(plan) => plan,
                Err(e) => {
                    self.fail(&mut report, &engine_id, None, &e);
                    continue;
                }
            };
            if plan.is_empty() {
                debug!(engine = %engine_id, "tables up to date");
                continue;
            }

            self.rebuild_tables(&engine_id, &tables, &plan, &mut report).await;
            self.migrate_tables(&handle, &tables, &plan, &mut report).await;
        }

        self.metrics.duration.record(started.elapsed().as_secs_f64());
        info!(
            engines = report.engines,
            tables = report.tables,
            rebuilds = report.rebuilds_queued.len(),
            migrated = report.migrated.len(),
            failures = report.failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reconciliation pass complete"
        );
        report
    }

    /// Diff and classify without changing anything
    pub async fn plan(&self, adapters: &[AdapterRef]) -> Result<Vec<EnginePlan>> {
        let mut active = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            if self.is_active(adapter.as_ref()).await? {
                active.push(Arc::clone(adapter));
            }
        }

        let mut plans = Vec::new();
        for (engine_id, tables) in group_by_engine(active) {
            let handle = self.connections.get(&engine_id)?;
            let plan = self.classify_engine(&handle, &tables).await?;
            let operator_statements = plan
                .migrate
                .values()
                .flat_map(|diffs| self.migrator.operator_statements(diffs))
                .collect();
            plans.push(EnginePlan {
                engine_id,
                rebuild: summarize(&plan.rebuild),
                migrate: summarize(&plan.migrate),
                operator_statements,
                plan,
            });
        }
        Ok(plans)
    }

    /// Whether the adapter's configuration still exists and is active
    async fn is_active(&self, adapter: &dyn IndicatorAdapter) -> Result<bool> {
        let config = adapter.config();
        if config.is_static() {
            return Ok(true);
        }
        let latest = self.catalog.get(&config.id).await?;
        let active = matches!(latest, Some(latest) if !latest.is_deactivated);
        if !active {
            debug!(config = %config.id, "configuration deleted or deactivated, skipping");
        }
        Ok(active)
    }

    async fn classify_engine(
        &self,
        handle: &EngineHandle,
        tables: &BTreeMap<String, AdapterRef>,
    ) -> Result<MigrationPlan> {
        let mut expected = ExpectedSchema::new();
        for adapter in tables.values() {
            expected.add_definition(adapter.definition());
        }
        let names: Vec<String> = tables.keys().cloned().collect();

        let engine = SchemaDiffEngine::new(Arc::clone(&handle.schema));
        let diffs = engine.get_diffs(&names, &expected).await?;
        let plan = self.classifier.classify(&diffs);
        debug!(
            engine = %handle.engine_id,
            diffs = diffs.len(),
            rebuild = plan.rebuild.len(),
            migrate = plan.migrate.len(),
            "classified schema diffs"
        );
        Ok(plan)
    }

    async fn rebuild_tables(
        &self,
        engine_id: &str,
        tables: &BTreeMap<String, AdapterRef>,
        plan: &MigrationPlan,
        report: &mut ReconcileReport,
    ) {
        for (table, diffs) in &plan.rebuild {
            let Some(adapter) = tables.get(table) else {
                continue;
            };
            match self.rebuilder.rebuild(adapter.as_ref(), diffs).await {
                Ok(RebuildDecision::Queued(job_id)) => {
                    self.metrics.rebuilds_queued.increment(1);
                    report.rebuilds_queued.insert(table.clone(), job_id);
                }
                Ok(RebuildDecision::Skipped) => report.rebuilds_skipped.push(table.clone()),
                Err(e) if e.category() == ErrorCategory::Stale => {
                    warn!(table = %table, error = %e, "stale rebuild ignored");
                    report.stale.push(table.clone());
                }
                Err(e) => self.fail(report, engine_id, Some(adapter.as_ref()), &e),
            }
        }
    }

    async fn migrate_tables(
        &self,
        handle: &EngineHandle,
        tables: &BTreeMap<String, AdapterRef>,
        plan: &MigrationPlan,
        report: &mut ReconcileReport,
    ) {
        let diffs: Vec<SchemaDiff> = plan.migrate.values().flatten().cloned().collect();
        if diffs.is_empty() {
            return;
        }

        let applied = match self.migrator.migrate(handle.connection.as_ref(), &diffs).await {
            Ok(applied) => applied,
            Err(e) => {
                self.fail(report, &handle.engine_id, None, &e);
                return;
            }
        };

        for (table, summaries) in applied {
            self.metrics.migrations.increment(1);
            if let Some(adapter) = tables.get(&table) {
                let entry = AuditEntry::new(summaries.clone(), &self.source);
                if let Err(e) = self.audit.record(&adapter.config().id, entry).await {
                    warn!(table = %table, error = %e, "failed to record migration in audit log");
                }
            }
            report.migrated.insert(table, summaries);
        }
    }

    /// Record a failure and alert operators
    fn fail(
        &self,
        report: &mut ReconcileReport,
        engine_id: &str,
        adapter: Option<&dyn IndicatorAdapter>,
        e: &RebuildError,
    ) {
        self.metrics.errors.increment(1);
        let table = adapter.map(|a| a.table_name().to_string());
        let config = adapter
            .and_then(|a| serde_json::to_value(a.config()).ok())
            .unwrap_or_default();
        self.alerts.notify(
            &format!("reconciliation failed on engine {}: {}", engine_id, e),
            serde_json::json!({
                "engine_id": engine_id,
                "table": table,
                "category": e.category(),
                "config": config,
            }),
        );
        report.failures.push(ReconcileFailure {
            engine_id: engine_id.to_string(),
            table,
            error: e.to_string(),
            category: e.category(),
            retriable: e.is_retriable(),
        });
    }
}

fn group_by_engine(adapters: Vec<AdapterRef>) -> EngineTables {
    let mut engines = EngineTables::new();
    for adapter in adapters.into_iter().filter(|a| a.is_schema_managed()) {
        let table = adapter.table_name().to_string();
        let engine_id = adapter.engine_id().to_string();
        if engines
            .entry(engine_id.clone())
            .or_default()
            .insert(table.clone(), adapter)
            .is_some()
        {
            warn!(engine = %engine_id, table = %table, "two data sources share a table");
        }
    }
    engines
}
