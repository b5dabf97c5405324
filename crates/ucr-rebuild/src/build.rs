//! # Iterative table builds
//!
//! Populating a report table walks the data source's units (one per case
//! type or form xmlns), pulls document ids for each unit from a
//! [`DocumentSource`] and loads them in fixed-size chunks. Every finished unit
//! is recorded through a [`ResumeHelper`], so an interrupted build continues
//! where it stopped instead of starting over.
//!
//! ## Entry points
//!
//! | Method | Table | Resume state |
//! |--------|-------|--------------|
//! | [`IterativeBuilder::rebuild`] | dropped and recreated | cleared |
//! | [`IterativeBuilder::rebuild_in_place`] | created if missing | honored |
//! | [`IterativeBuilder::resume`] | untouched | required |
//!
//! Build bookkeeping is stamped on non-static configurations: `initiated` at
//! the start and `finished` at the end, but only if no newer build has been
//! started in between.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::adapter::IndicatorAdapter;
use crate::catalog::ConfigStore;
use crate::clock::{Clock, SystemClock};
use crate::definition::DataSourceConfig;
use crate::error::Result;
use crate::loader::LoadStats;
use crate::producer::Document;
use crate::resume::{CompletedUnit, ResumeHelper};
use crate::store::ListStore;

/// Document ids loaded per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// Read access to the documents a data source is built from
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Ids of the documents of one unit, in a stable order
    async fn document_ids(
        &self,
        domain: &str,
        doc_type: &str,
        unit: Option<&str>,
    ) -> Result<Vec<String>>;

    /// Fetch documents by id; missing ids are skipped
    async fn documents(&self, ids: &[String]) -> Result<Vec<Document>>;
}

/// In-process document source
#[derive(Default)]
pub struct MemoryDocumentSource {
    docs: RwLock<BTreeMap<String, Document>>,
}

impl MemoryDocumentSource {
    /// Empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Source seeded with documents
    pub fn with_documents(docs: impl IntoIterator<Item = Document>) -> Self {
        let source = Self::new();
        for doc in docs {
            source.insert(doc);
        }
        source
    }

    /// Insert or replace a document
    pub fn insert(&self, doc: Document) {
        self.docs.write().insert(doc.id.clone(), doc);
    }

    /// Remove a document
    pub fn remove(&self, id: &str) -> Option<Document> {
        self.docs.write().remove(id)
    }

    /// Number of documents
    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    /// Whether the source holds no documents
    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }
}

#[async_trait]
impl DocumentSource for MemoryDocumentSource {
    async fn document_ids(
        &self,
        domain: &str,
        doc_type: &str,
        unit: Option<&str>,
    ) -> Result<Vec<String>> {
        Ok(self
            .docs
            .read()
            .values()
            .filter(|d| d.domain == domain && d.doc_type == doc_type)
            .filter(|d| unit.map_or(true, |u| d.unit() == Some(u)))
            .map(|d| d.id.clone())
            .collect())
    }

    async fn documents(&self, ids: &[String]) -> Result<Vec<Document>> {
        let docs = self.docs.read();
        Ok(ids.iter().filter_map(|id| docs.get(id).cloned()).collect())
    }
}

/// Which build bookkeeping a run stamps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildMode {
    Rebuild,
    InPlace,
}

/// Outcome of one build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    /// Units processed in this run
    pub units_built: usize,
    /// Units skipped because an earlier run finished them
    pub units_skipped: usize,
    /// Whether the configuration was marked finished
    pub marked_finished: bool,
    /// Aggregated load counters
    pub load: LoadStats,
}

/// Walks a data source's units and loads its documents
pub struct IterativeBuilder {
    source: Arc<dyn DocumentSource>,
    resume_store: Arc<dyn ListStore>,
    catalog: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
    chunk_size: usize,
    limit: Option<usize>,
}

impl IterativeBuilder {
    /// Create a builder
    pub fn new(
        source: Arc<dyn DocumentSource>,
        resume_store: Arc<dyn ListStore>,
        catalog: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            source,
            resume_store,
            catalog,
            clock: Arc::new(SystemClock),
            chunk_size: DEFAULT_CHUNK_SIZE,
            limit: None,
        }
    }

    /// Use a custom time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Document ids per chunk
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Cap documents per unit
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Resume helper for an adapter's configuration
    pub fn resume_helper(&self, config: &DataSourceConfig) -> ResumeHelper {
        ResumeHelper::new(Arc::clone(&self.resume_store), config)
    }

    /// Drop, recreate and fully populate the table
    pub async fn rebuild(&self, adapter: &dyn IndicatorAdapter) -> Result<BuildStats> {
        let config = adapter.config();
        let initiated = self.clock.now();
        if !config.is_static() {
            let mut build = config.build.clone();
            build.initiated = Some(initiated);
            build.finished = false;
            build.rebuilt_asynchronously = false;
            self.catalog.save_build_info(&config.id, &build).await?;
        }

        adapter.rebuild_table().await?;
        // Markers from an earlier build would skip units of the new, empty table
        self.resume_helper(config).clear().await?;
        self.iterate(adapter, BuildMode::Rebuild, Some(initiated)).await
    }

    /// Populate the table without dropping it first
    pub async fn rebuild_in_place(&self, adapter: &dyn IndicatorAdapter) -> Result<BuildStats> {
        let config = adapter.config();
        let initiated = self.clock.now();
        if !config.is_static() {
            let mut build = config.build.clone();
            build.initiated_in_place = Some(initiated);
            build.finished_in_place = false;
            build.rebuilt_asynchronously = false;
            self.catalog.save_build_info(&config.id, &build).await?;
        }

        adapter.build_table().await?;
        self.iterate(adapter, BuildMode::InPlace, Some(initiated)).await
    }

    /// Continue an interrupted full build
    pub async fn resume(&self, adapter: &dyn IndicatorAdapter) -> Result<BuildStats> {
        let config = adapter.config();
        let initiated = match self.catalog.get(&config.id).await? {
            Some(latest) => latest.build.initiated,
            None => config.build.initiated,
        };
        info!(config = %config.id, table = %adapter.table_name(), "resuming build");
        self.iterate(adapter, BuildMode::Rebuild, initiated).await
    }

    async fn iterate(
        &self,
        adapter: &dyn IndicatorAdapter,
        mode: BuildMode,
        initiated: Option<DateTime<Utc>>,
    ) -> Result<BuildStats> {
        let config = adapter.config();
        let helper = self.resume_helper(config);
        let completed: HashSet<CompletedUnit> =
            helper.get_completed_units().await?.into_iter().collect();
        let started = Instant::now();
        let mut stats = BuildStats::default();

        for unit in config.build_units() {
            let marker = CompletedUnit::new(&config.domain, unit.as_deref());
            if completed.contains(&marker) {
                debug!(config = %config.id, unit = %marker, "unit already built");
                stats.units_skipped += 1;
                continue;
            }

            let mut ids = self
                .source
                .document_ids(&config.domain, &config.referenced_doc_type, unit.as_deref())
                .await?;
            if let Some(limit) = self.limit {
                ids.truncate(limit);
            }

            for chunk in ids.chunks(self.chunk_size) {
                let docs = self.source.documents(chunk).await?;
                let loaded = adapter.save_documents(&docs).await?;
                stats.load.merge(&loaded);
            }

            helper.add_completed_unit(&config.domain, unit.as_deref()).await?;
            stats.units_built += 1;
        }

        helper.clear().await?;
        stats.marked_finished = self.mark_finished(config, mode, initiated).await?;
        stats.load.elapsed = started.elapsed();

        info!(
            config = %config.id,
            table = %adapter.table_name(),
            units = stats.units_built,
            skipped = stats.units_skipped,
            documents = stats.load.documents,
            rows = stats.load.rows_inserted,
            elapsed_ms = duration_ms(stats.load.elapsed),
            "table build complete"
        );
        Ok(stats)
    }

    /// Stamp `finished` unless a newer build started meanwhile
    async fn mark_finished(
        &self,
        config: &DataSourceConfig,
        mode: BuildMode,
        initiated: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        if config.is_static() {
            return Ok(false);
        }
        let Some(latest) = self.catalog.get(&config.id).await? else {
            return Ok(false);
        };

        let mut build = latest.build;
        let current = match mode {
            BuildMode::Rebuild => build.initiated,
            BuildMode::InPlace => build.initiated_in_place,
        };
        if current != initiated {
            info!(config = %config.id, "newer build in progress, not marking finished");
            return Ok(false);
        }

        match mode {
            BuildMode::Rebuild => build.finished = true,
            BuildMode::InPlace => build.finished_in_place = true,
        }
        self.catalog.save_build_info(&config.id, &build).await?;
        Ok(true)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn case(id: &str, case_type: &str) -> Document {
        Document::new(id, "demo", "CommCareCase", json!({"type": case_type}))
    }

    #[tokio::test]
    async fn test_memory_source_filters_by_unit() {
        let source = MemoryDocumentSource::with_documents([
            case("c1", "patient"),
            case("c2", "household"),
            case("c3", "patient"),
            Document::new("f1", "demo", "XFormInstance", json!({})),
            Document::new("c4", "other", "CommCareCase", json!({"type": "patient"})),
        ]);

        let ids = source
            .document_ids("demo", "CommCareCase", Some("patient"))
            .await
            .unwrap();
        assert_eq!(ids, vec!["c1", "c3"]);

        let all = source.document_ids("demo", "CommCareCase", None).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_documents_skips_missing_ids() {
        let source = MemoryDocumentSource::with_documents([case("c1", "patient")]);
        let docs = source
            .documents(&["c1".to_string(), "gone".to_string()])
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "c1");
    }
}
