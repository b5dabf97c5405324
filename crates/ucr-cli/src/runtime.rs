//! Wiring of the engine's parts from a [`CliConfig`]

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use ucr_rdbc::postgres::PgConnectionFactory;
use ucr_rebuild::prelude::*;
use ucr_rebuild::store::PgStore;

use crate::config::CliConfig;

/// Connections and shared state for one command
pub struct Runtime {
    connections: Arc<ConnectionManager>,
    catalog: Arc<MemoryConfigStore>,
    cache: Arc<dyn SharedCache>,
    lists: Arc<dyn ListStore>,
    factory: Arc<AdapterFactory>,
    alerts: Arc<Notifier>,
    filter: ConfigFilter,
}

impl Runtime {
    /// Connect every engine and seed the catalog from the data source files
    pub async fn connect(config: &CliConfig) -> anyhow::Result<Self> {
        let sources = config.load_data_sources()?;
        let filter = ConfigFilter::from_processor(&config.rebuild.processor)?;

        let connections =
            Arc::new(ConnectionManager::connect_all(&config.engines, &PgConnectionFactory).await?);
        info!(engines = config.engines.len(), "connected");

        let (cache, lists): (Arc<dyn SharedCache>, Arc<dyn ListStore>) =
            match &config.metadata_engine {
                Some(engine_id) => {
                    let handle = connections.get(engine_id)?;
                    let prefix = config.metadata_table_prefix.as_deref();
                    let store = Arc::new(PgStore::new(handle.connection.clone(), prefix).await?);
                    (store.clone() as Arc<dyn SharedCache>, store as Arc<dyn ListStore>)
                }
                None => {
                    warn!("no metadata_engine configured, coordination state is process-local");
                    let store = Arc::new(MemoryStore::new());
                    (store.clone() as Arc<dyn SharedCache>, store as Arc<dyn ListStore>)
                }
            };

        let factory = Arc::new(
            AdapterFactory::new(
                connections.clone(),
                Arc::new(DefaultDefinitionProvider),
                Arc::new(JsonFieldProducer),
            )
            .with_load_batch_size(config.rebuild.build.load_batch_size),
        );

        Ok(Self {
            connections,
            catalog: Arc::new(MemoryConfigStore::with_configs(sources)),
            cache,
            lists,
            factory,
            alerts: Arc::new(Notifier::new()),
            filter,
        })
    }

    /// The catalog seeded at connect time
    pub fn catalog(&self) -> &Arc<MemoryConfigStore> {
        &self.catalog
    }

    /// The adapter factory
    pub fn factory(&self) -> &Arc<AdapterFactory> {
        &self.factory
    }

    /// Active configurations this worker handles
    pub async fn handled_sources(&self) -> anyhow::Result<Vec<DataSourceConfig>> {
        Ok(self.filter.apply(self.catalog.list_active().await?))
    }

    /// Adapters for `sources`, skipping the ones that fail to build
    pub fn adapters(&self, sources: &[DataSourceConfig]) -> Vec<Arc<dyn IndicatorAdapter>> {
        sources
            .iter()
            .filter_map(|source| match self.factory.build(source) {
                Ok(adapter) => Some(adapter),
                Err(e) => {
                    warn!(config = %source.id, error = %e, "broken data source, skipped");
                    None
                }
            })
            .collect()
    }

    /// Orchestrator queueing rebuilds on a channel; the receiver feeds a worker
    pub fn orchestrator(
        &self,
        config: &CliConfig,
    ) -> (Arc<RebuildOrchestrator>, mpsc::Receiver<RebuildJob>) {
        let source = config.rebuild.processor.name.clone();
        let (queue, jobs) = ChannelRebuildQueue::channel(config.rebuild.build.queue_capacity);
        let audit = Arc::new(StoreAuditLog::new(self.lists.clone()));

        let rebuilder = TableRebuilder::new(
            self.catalog.clone(),
            Arc::new(queue),
            Arc::new(JobTracker::new()),
        )
        .with_audit(audit.clone())
        .with_source(source.clone());
        let classifier = MigrationClassifier::with_ignored_index_columns(
            config.rebuild.classifier.ignored_index_columns.iter().cloned(),
        );
        let orchestrator = RebuildOrchestrator::new(
            self.catalog.clone(),
            self.connections.clone(),
            rebuilder,
            audit,
            self.alerts.clone(),
        )
        .with_classifier(classifier)
        .with_source(source);

        (Arc::new(orchestrator), jobs)
    }

    /// Builder reading from the configured documents file
    pub fn builder(&self, config: &CliConfig) -> anyhow::Result<IterativeBuilder> {
        let documents = MemoryDocumentSource::with_documents(config.load_documents()?);
        info!(documents = documents.len(), "documents loaded");

        Ok(
            IterativeBuilder::new(Arc::new(documents), self.lists.clone(), self.catalog.clone())
                .with_chunk_size(config.rebuild.build.chunk_size)
                .with_limit(config.rebuild.build.limit),
        )
    }

    /// Worker for the jobs an orchestrator queues
    pub fn worker(
        &self,
        config: &CliConfig,
        tracker: Arc<JobTracker>,
    ) -> anyhow::Result<RebuildWorker> {
        Ok(RebuildWorker::new(
            self.catalog.clone(),
            self.factory.clone(),
            Arc::new(self.builder(config)?),
            tracker,
            self.alerts.clone(),
        ))
    }

    /// Table manager coordinated through the shared cache
    pub fn table_manager(
        &self,
        config: &CliConfig,
        orchestrator: Arc<RebuildOrchestrator>,
    ) -> TableManager {
        let processor = &config.rebuild.processor;
        let coordinator = TaskCoordinator::new(
            processor.name.clone(),
            config.rebuild.coordinator.interval_for(processor.static_only),
            self.cache.clone(),
        )
        .with_buffer(config.rebuild.coordinator.expiry_buffer);

        TableManager::new(self.catalog.clone(), self.factory.clone(), orchestrator, coordinator)
            .with_filter(self.filter.clone())
            .with_slow_save_threshold(processor.slow_save_threshold)
    }

    /// Close every engine connection
    pub async fn close(&self) {
        let raised = self.alerts.stats().sent();
        if raised > 0 {
            warn!(alerts = raised, "alerts were raised during this run");
        }
        if let Err(e) = self.connections.close_all().await {
            warn!(error = %e, "failed to close connections");
        }
    }
}
