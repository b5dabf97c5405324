//! # Change processing
//!
//! A [`TableManager`] sits inside a change-stream worker. It keeps the
//! adapters of the data sources this worker owns, grouped by domain, and
//! routes every changed document to them.
//!
//! The adapter set is rebuilt ("bootstrapped") on first use and again once
//! the bootstrap interval has elapsed. Every bootstrap reloads
//! configurations locally, but the reconciliation pass that follows runs on
//! only one worker per interval, arbitrated by a [`TaskCoordinator`].

use chrono::{DateTime, Utc};
use metrics::Counter;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterFactory, IndicatorAdapter, SaveOutcome};
use crate::catalog::ConfigStore;
use crate::clock::{chrono_duration, Clock, SystemClock};
use crate::coordinator::TaskCoordinator;
use crate::definition::DataSourceConfig;
use crate::error::{RebuildError, Result};
use crate::filter::ConfigFilter;
use crate::orchestrator::{RebuildOrchestrator, ReconcileReport};
use crate::producer::Document;

/// Coordinator task key of the reconciliation that follows a bootstrap
pub const RECONCILE_TASK: &str = "rebuild-tables";

/// Default threshold above which a save is logged as slow
pub const DEFAULT_SLOW_SAVE_THRESHOLD: Duration = Duration::from_millis(500);

/// A document change from the stream
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Domain of the document, if known
    pub domain: Option<String>,
    /// Document id
    pub doc_id: String,
    /// Whether the document was deleted
    pub deleted: bool,
    /// Current document body; absent for deletions
    pub document: Option<Document>,
}

impl ChangeEvent {
    /// Change carrying a saved document
    pub fn saved(document: Document) -> Self {
        Self {
            domain: Some(document.domain.clone()),
            doc_id: document.id.clone(),
            deleted: false,
            document: Some(document),
        }
    }

    /// Deletion of a document
    pub fn deleted(domain: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            domain: Some(domain.into()),
            doc_id: doc_id.into(),
            deleted: true,
            document: None,
        }
    }
}

/// What processing a change did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// No domain, or no data source for the domain
    Skipped,
    /// Rows removed from this many tables
    Deleted(usize),
    /// Per-table results of a save
    Processed {
        /// Tables that received rows
        saved: usize,
        /// Tables the document no longer belongs in
        removed: usize,
        /// Tables that failed
        failed: usize,
    },
}

/// Change processing metrics
pub struct ProcessorMetrics {
    /// Changes handled
    pub changes: Counter,
    /// Saves above the slow threshold
    pub slow_saves: Counter,
    /// Adapters paused after an indicator warning
    pub paused_adapters: Counter,
    /// Failed table writes
    pub errors: Counter,
}

impl ProcessorMetrics {
    /// Register the processor metrics
    pub fn new() -> Self {
        Self {
            changes: metrics::counter!("ucr_processor_changes_total"),
            slow_saves: metrics::counter!("ucr_processor_slow_saves_total"),
            paused_adapters: metrics::counter!("ucr_processor_paused_adapters_total"),
            errors: metrics::counter!("ucr_processor_errors_total"),
        }
    }
}

impl Default for ProcessorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct BootstrapState {
    last_bootstrapped: Option<DateTime<Utc>>,
}

/// Keeps a worker's adapters and applies document changes to them
pub struct TableManager {
    catalog: Arc<dyn ConfigStore>,
    factory: Arc<AdapterFactory>,
    orchestrator: Arc<RebuildOrchestrator>,
    coordinator: TaskCoordinator,
    filter: ConfigFilter,
    clock: Arc<dyn Clock>,
    slow_save_threshold: Duration,
    adapters_by_domain: RwLock<HashMap<String, Vec<Arc<dyn IndicatorAdapter>>>>,
    state: RwLock<BootstrapState>,
    metrics: ProcessorMetrics,
}

impl TableManager {
    /// Create a manager; the coordinator's interval is the bootstrap interval
    pub fn new(
        catalog: Arc<dyn ConfigStore>,
        factory: Arc<AdapterFactory>,
        orchestrator: Arc<RebuildOrchestrator>,
        coordinator: TaskCoordinator,
    ) -> Self {
        Self {
            catalog,
            factory,
            orchestrator,
            coordinator,
            filter: ConfigFilter::all(),
            clock: Arc::new(SystemClock),
            slow_save_threshold: DEFAULT_SLOW_SAVE_THRESHOLD,
            adapters_by_domain: RwLock::new(HashMap::new()),
            state: RwLock::new(BootstrapState::default()),
            metrics: ProcessorMetrics::new(),
        }
    }

    /// Restrict the data sources this worker handles
    pub fn with_filter(mut self, filter: ConfigFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Use a custom time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Saves slower than this are logged
    pub fn with_slow_save_threshold(mut self, threshold: Duration) -> Self {
        self.slow_save_threshold = threshold;
        self
    }

    /// When the adapters were last loaded
    pub fn last_bootstrapped(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_bootstrapped
    }

    /// Whether the adapter set is missing or older than the interval
    pub fn needs_bootstrap(&self) -> bool {
        match self.state.read().last_bootstrapped {
            None => true,
            Some(at) => self.clock.now() - at > chrono_duration(self.coordinator.interval()),
        }
    }

    /// Adapters currently loaded for a domain
    pub fn adapters_for(&self, domain: &str) -> Vec<Arc<dyn IndicatorAdapter>> {
        self.adapters_by_domain
            .read()
            .get(domain)
            .cloned()
            .unwrap_or_default()
    }

    /// All loaded adapters
    pub fn adapters(&self) -> Vec<Arc<dyn IndicatorAdapter>> {
        self.adapters_by_domain
            .read()
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// Load adapters and, if this worker wins the window, reconcile tables.
    ///
    /// `configs` overrides the configurations read from the catalog.
    pub async fn bootstrap(
        &self,
        configs: Option<Vec<DataSourceConfig>>,
    ) -> Result<Option<ReconcileReport>> {
        let configs = match configs {
            Some(configs) => configs,
            None => self.filter.apply(self.catalog.list_active().await?),
        };

        let mut by_domain: HashMap<String, Vec<Arc<dyn IndicatorAdapter>>> = HashMap::new();
        for config in &configs {
            match self.factory.build(config) {
                Ok(adapter) => by_domain.entry(config.domain.clone()).or_default().push(adapter),
                Err(e) => warn!(config = %config.id, error = %e, "broken data source, not loaded"),
            }
        }
        let loaded: usize = by_domain.values().map(Vec::len).sum();
        let adapters: Vec<_> = by_domain.values().flatten().cloned().collect();
        *self.adapters_by_domain.write() = by_domain;
        self.state.write().last_bootstrapped = Some(self.clock.now());
        info!(worker = %self.coordinator.name(), adapters = loaded, "bootstrapped data sources");

        if !self.coordinator.should_run(RECONCILE_TASK).await? {
            debug!(
                worker = %self.coordinator.name(),
                "tables reconciled recently by another worker"
            );
            return Ok(None);
        }
        Ok(Some(self.orchestrator.reconcile(&adapters).await))
    }

    /// Bootstrap when the adapter set is missing or stale
    pub async fn bootstrap_if_needed(&self) -> Result<Option<ReconcileReport>> {
        if self.needs_bootstrap() {
            self.bootstrap(None).await
        } else {
            Ok(None)
        }
    }

    /// Forget the last reconciliation so the next bootstrap runs one
    pub async fn reset_reconcile(&self) -> Result<()> {
        self.coordinator.reset(RECONCILE_TASK).await
    }

    /// Stop writing to an adapter until the next bootstrap
    pub fn remove_adapter(&self, domain: &str, table_name: &str) -> bool {
        let mut adapters = self.adapters_by_domain.write();
        let Some(list) = adapters.get_mut(domain) else {
            return false;
        };
        let before = list.len();
        list.retain(|a| a.table_name() != table_name);
        before != list.len()
    }

    /// Apply one document change to the tables of its domain
    pub async fn process_change(&self, change: &ChangeEvent) -> Result<ChangeOutcome> {
        self.bootstrap_if_needed().await?;
        self.metrics.changes.increment(1);

        let Some(domain) = change.domain.as_deref() else {
            return Ok(ChangeOutcome::Skipped);
        };
        let adapters = self.adapters_for(domain);
        if adapters.is_empty() {
            return Ok(ChangeOutcome::Skipped);
        }

        let document = match (&change.document, change.deleted) {
            (Some(doc), false) => doc,
            _ => {
                let removed = self.delete_everywhere(domain, &change.doc_id, &adapters).await;
                return Ok(ChangeOutcome::Deleted(removed));
            }
        };

        let (mut saved, mut removed, mut failed) = (0, 0, 0);
        for adapter in &adapters {
            let started = Instant::now();
            let result = adapter.save_document(document).await;
            let elapsed = started.elapsed();

            match result {
                Ok(SaveOutcome::Saved(_)) => saved += 1,
                Ok(SaveOutcome::Removed) => removed += 1,
                Err(RebuildError::Warning(message)) => {
                    failed += 1;
                    self.metrics.paused_adapters.increment(1);
                    warn!(
                        domain,
                        table = %adapter.table_name(),
                        warning = %message,
                        "pausing data source until next bootstrap"
                    );
                    self.remove_adapter(domain, adapter.table_name());
                }
                Err(e) if e.is_table_missing() => {
                    debug!(
                        table = %adapter.table_name(),
                        doc_id = %change.doc_id,
                        "table missing, rebuild catching up"
                    );
                }
                Err(e) => {
                    failed += 1;
                    self.metrics.errors.increment(1);
                    error!(
                        table = %adapter.table_name(),
                        doc_id = %change.doc_id,
                        error = %e,
                        "failed to save document"
                    );
                }
            }

            if elapsed > self.slow_save_threshold {
                self.metrics.slow_saves.increment(1);
                warn!(
                    domain,
                    table = %adapter.table_name(),
                    doc_id = %change.doc_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "slow save"
                );
            }
        }

        Ok(ChangeOutcome::Processed { saved, removed, failed })
    }

    async fn delete_everywhere(
        &self,
        domain: &str,
        doc_id: &str,
        adapters: &[Arc<dyn IndicatorAdapter>],
    ) -> usize {
        let mut deleted = 0;
        for adapter in adapters {
            match adapter.delete(doc_id).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_table_missing() => {
                    debug!(
                        table = %adapter.table_name(),
                        doc_id,
                        "table missing, rebuild catching up"
                    );
                }
                Err(e) => {
                    self.metrics.errors.increment(1);
                    error!(
                        domain,
                        table = %adapter.table_name(),
                        doc_id,
                        error = %e,
                        "failed to delete document rows"
                    );
                }
            }
        }
        deleted
    }
}
