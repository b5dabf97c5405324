//! # Asynchronous table rebuilds
//!
//! A reconciliation pass never rebuilds inline. [`TableRebuilder`] checks
//! that the configuration it holds is current, honors the "disable
//! destructive rebuild" flag and then enqueues a [`RebuildJob`]. A
//! [`RebuildWorker`] drains the queue out of band, drops and recreates the
//! table and replays its documents.
//!
//! ## Job lifecycle
//!
//! ```text
//! Requested ──► Running ──► Completed
//!                  │
//!                  └──────► Failed ──► operator alert
//! ```
//!
//! Failed jobs are not retried automatically. The worker repeats the
//! staleness check when it picks a job up: a configuration edited between
//! request and execution aborts the job instead of rebuilding against an
//! outdated definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{Counter, Histogram};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{AdapterFactory, IndicatorAdapter};
use crate::audit::{AuditEntry, AuditLog};
use crate::build::{BuildStats, IterativeBuilder};
use crate::catalog::ConfigStore;
use crate::definition::DataSourceConfig;
use crate::diff::{DiffSummary, SchemaDiff};
use crate::error::{ErrorCategory, RebuildError, Result};
use crate::notify::AlertSink;

/// Default origin tag for jobs and audit entries
pub const DEFAULT_SOURCE: &str = "ucr-rebuild";

/// A queued drop-recreate-replay of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildJob {
    /// Job id
    pub id: Uuid,
    /// Data source id
    pub config_id: String,
    /// Revision the rebuild was requested for
    pub revision: String,
    /// Physical table
    pub table: String,
    /// Engine the table lives on
    pub engine_id: String,
    /// Owning domain
    pub domain: String,
    /// Diffs that triggered the rebuild
    pub diffs: Vec<DiffSummary>,
    /// Origin tag
    pub source: String,
    /// When the job was enqueued
    pub requested_at: DateTime<Utc>,
}

impl RebuildJob {
    /// Job for a configuration
    pub fn new(
        config: &DataSourceConfig,
        table: impl Into<String>,
        diffs: Vec<DiffSummary>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            config_id: config.id.clone(),
            revision: config.revision.clone(),
            table: table.into(),
            engine_id: config.engine_id.clone(),
            domain: config.domain.clone(),
            diffs,
            source: source.into(),
            requested_at: Utc::now(),
        }
    }
}

/// Destination for rebuild jobs
#[async_trait]
pub trait RebuildQueue: Send + Sync {
    /// Hand a job to the background workers
    async fn enqueue(&self, job: RebuildJob) -> Result<()>;
}

/// Rebuild queue over a bounded tokio channel
#[derive(Clone)]
pub struct ChannelRebuildQueue {
    sender: mpsc::Sender<RebuildJob>,
}

impl ChannelRebuildQueue {
    /// Queue plus the receiving end for a [`RebuildWorker`]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RebuildJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl RebuildQueue for ChannelRebuildQueue {
    async fn enqueue(&self, job: RebuildJob) -> Result<()> {
        self.sender.send(job).await.map_err(|_| RebuildError::QueueClosed)
    }
}

/// Rebuild job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Enqueued, not yet picked up
    Requested,
    /// A worker is rebuilding the table
    Running,
    /// Table rebuilt and repopulated
    Completed,
    /// Aborted; needs an operator
    Failed,
}

impl JobState {
    /// Whether the job reached a final state
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Observable status of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Job id
    pub job_id: Uuid,
    /// Data source id
    pub config_id: String,
    /// Physical table
    pub table: String,
    /// Current state
    pub state: JobState,
    /// Enqueue time
    pub requested_at: DateTime<Utc>,
    /// Pick-up time
    pub started_at: Option<DateTime<Utc>>,
    /// Completion or failure time
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure description
    pub error: Option<String>,
}

/// In-process registry of job states
#[derive(Default)]
pub struct JobTracker {
    jobs: DashMap<Uuid, JobStatus>,
}

impl JobTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly enqueued job
    pub fn requested(&self, job: &RebuildJob) {
        self.jobs.insert(
            job.id,
            JobStatus {
                job_id: job.id,
                config_id: job.config_id.clone(),
                table: job.table.clone(),
                state: JobState::Requested,
                requested_at: job.requested_at,
                started_at: None,
                finished_at: None,
                error: None,
            },
        );
    }

    /// Mark a job as picked up
    pub fn running(&self, job: &RebuildJob) {
        if !self.jobs.contains_key(&job.id) {
            self.requested(job);
        }
        if let Some(mut status) = self.jobs.get_mut(&job.id) {
            status.state = JobState::Running;
            status.started_at = Some(Utc::now());
        }
    }

    /// Mark a job as done
    pub fn completed(&self, job_id: Uuid) {
        if let Some(mut status) = self.jobs.get_mut(&job_id) {
            status.state = JobState::Completed;
            status.finished_at = Some(Utc::now());
        }
    }

    /// Mark a job as failed
    pub fn failed(&self, job_id: Uuid, error: &RebuildError) {
        if let Some(mut status) = self.jobs.get_mut(&job_id) {
            status.state = JobState::Failed;
            status.finished_at = Some(Utc::now());
            status.error = Some(error.to_string());
        }
    }

    /// Status of one job
    pub fn get(&self, job_id: Uuid) -> Option<JobStatus> {
        self.jobs.get(&job_id).map(|s| s.clone())
    }

    /// Jobs of one configuration, oldest first
    pub fn for_config(&self, config_id: &str) -> Vec<JobStatus> {
        let mut jobs: Vec<_> = self
            .jobs
            .iter()
            .filter(|s| s.config_id == config_id)
            .map(|s| s.clone())
            .collect();
        jobs.sort_by_key(|s| s.requested_at);
        jobs
    }

    /// Every tracked job, oldest first
    pub fn statuses(&self) -> Vec<JobStatus> {
        let mut jobs: Vec<_> = self.jobs.iter().map(|s| s.clone()).collect();
        jobs.sort_by_key(|s| s.requested_at);
        jobs
    }

    /// Jobs not yet in a final state
    pub fn pending(&self) -> usize {
        self.jobs.iter().filter(|s| !s.state.is_terminal()).count()
    }
}

/// What [`TableRebuilder::rebuild`] decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildDecision {
    /// Job enqueued
    Queued(Uuid),
    /// Destructive rebuild disabled for an existing table
    Skipped,
}

/// Fail with [`RebuildError::StaleRebuild`] if `config` is behind storage
pub async fn ensure_current(catalog: &dyn ConfigStore, config: &DataSourceConfig) -> Result<()> {
    if config.is_static() {
        return Ok(());
    }
    let latest = catalog
        .latest_revision(&config.id)
        .await?
        .ok_or_else(|| RebuildError::NotFound(config.id.clone()))?;
    if latest != config.revision {
        return Err(RebuildError::StaleRebuild {
            config_id: config.id.clone(),
            current: config.revision.clone(),
            latest,
        });
    }
    Ok(())
}

/// Decides whether a table may be rebuilt and enqueues the job
pub struct TableRebuilder {
    catalog: Arc<dyn ConfigStore>,
    queue: Arc<dyn RebuildQueue>,
    tracker: Arc<JobTracker>,
    audit: Option<Arc<dyn AuditLog>>,
    source: String,
}

impl TableRebuilder {
    /// Create a rebuilder
    pub fn new(
        catalog: Arc<dyn ConfigStore>,
        queue: Arc<dyn RebuildQueue>,
        tracker: Arc<JobTracker>,
    ) -> Self {
        Self {
            catalog,
            queue,
            tracker,
            audit: None,
            source: DEFAULT_SOURCE.to_string(),
        }
    }

    /// Record skipped rebuilds in an audit log
    pub fn with_audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Origin tag stamped on jobs
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Job registry
    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    /// Request a rebuild of the adapter's table
    pub async fn rebuild(
        &self,
        adapter: &dyn IndicatorAdapter,
        diffs: &[SchemaDiff],
    ) -> Result<RebuildDecision> {
        let config = adapter.config();
        ensure_current(self.catalog.as_ref(), config).await?;

        let summaries: Vec<DiffSummary> = diffs.iter().map(SchemaDiff::summary).collect();

        if !config.is_static()
            && config.disable_destructive_rebuild
            && adapter.table_exists().await?
        {
            info!(
                config = %config.id,
                table = %adapter.table_name(),
                diffs = summaries.len(),
                "destructive rebuild disabled, skipping"
            );
            if let Some(audit) = &self.audit {
                let entry = AuditEntry::new(summaries, format!("{}:rebuild-skipped", self.source));
                audit.record(&config.id, entry).await?;
            }
            return Ok(RebuildDecision::Skipped);
        }

        let job = RebuildJob::new(config, adapter.table_name(), summaries, &self.source);
        let job_id = job.id;
        self.tracker.requested(&job);
        if let Err(e) = self.queue.enqueue(job).await {
            self.tracker.failed(job_id, &e);
            return Err(e);
        }
        info!(
            config = %config.id,
            table = %adapter.table_name(),
            engine = %config.engine_id,
            job_id = %job_id,
            "rebuild queued"
        );
        Ok(RebuildDecision::Queued(job_id))
    }
}

/// Worker-level metrics
pub struct WorkerMetrics {
    /// Jobs completed
    pub completed: Counter,
    /// Jobs failed
    pub failed: Counter,
    /// Job duration
    pub duration: Histogram,
}

impl WorkerMetrics {
    /// Register the worker metrics
    pub fn new() -> Self {
        Self {
            completed: metrics::counter!("ucr_rebuild_jobs_completed_total"),
            failed: metrics::counter!("ucr_rebuild_jobs_failed_total"),
            duration: metrics::histogram!("ucr_rebuild_job_duration_seconds"),
        }
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes rebuild jobs
pub struct RebuildWorker {
    catalog: Arc<dyn ConfigStore>,
    factory: Arc<AdapterFactory>,
    builder: Arc<IterativeBuilder>,
    tracker: Arc<JobTracker>,
    alerts: Arc<dyn AlertSink>,
    metrics: WorkerMetrics,
}

impl RebuildWorker {
    /// Create a worker
    pub fn new(
        catalog: Arc<dyn ConfigStore>,
        factory: Arc<AdapterFactory>,
        builder: Arc<IterativeBuilder>,
        tracker: Arc<JobTracker>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            catalog,
            factory,
            builder,
            tracker,
            alerts,
            metrics: WorkerMetrics::new(),
        }
    }

    /// Run one job to completion
    pub async fn process(&self, job: RebuildJob) -> Result<BuildStats> {
        self.tracker.running(&job);
        let started = Instant::now();
        info!(job_id = %job.id, config = %job.config_id, table = %job.table, "rebuild started");

        let result = self.execute(&job).await;
        self.metrics.duration.record(started.elapsed().as_secs_f64());

        match &result {
            Ok(stats) => {
                self.tracker.completed(job.id);
                self.metrics.completed.increment(1);
                info!(
                    job_id = %job.id,
                    table = %job.table,
                    documents = stats.load.documents,
                    rows = stats.load.rows_inserted,
                    "rebuild completed"
                );
            }
            Err(e) => {
                self.tracker.failed(job.id, e);
                self.metrics.failed.increment(1);
                if e.category() == ErrorCategory::Stale {
                    warn!(
                        job_id = %job.id,
                        table = %job.table,
                        error = %e,
                        "stale rebuild aborted"
                    );
                } else {
                    self.alert(&job, e).await;
                }
            }
        }
        result
    }

    async fn execute(&self, job: &RebuildJob) -> Result<BuildStats> {
        let config = self
            .catalog
            .get(&job.config_id)
            .await?
            .ok_or_else(|| RebuildError::NotFound(job.config_id.clone()))?;

        if !config.is_static() && config.revision != job.revision {
            return Err(RebuildError::StaleRebuild {
                config_id: job.config_id.clone(),
                current: job.revision.clone(),
                latest: config.revision,
            });
        }

        let adapter = self.factory.build(&config)?;
        self.builder.rebuild(adapter.as_ref()).await
    }

    async fn alert(&self, job: &RebuildJob, e: &RebuildError) {
        let config = match self.catalog.get(&job.config_id).await {
            Ok(Some(config)) => serde_json::to_value(&config).unwrap_or_default(),
            _ => serde_json::Value::Null,
        };
        self.alerts.notify(
            &format!("rebuild of table {} failed: {}", job.table, e),
            serde_json::json!({
                "job_id": job.id,
                "table": job.table,
                "engine_id": job.engine_id,
                "domain": job.domain,
                "config": config,
            }),
        );
    }

    /// Drain the queue until every sender is gone
    pub async fn run(&self, mut jobs: mpsc::Receiver<RebuildJob>) {
        debug!("rebuild worker started");
        while let Some(job) = jobs.recv().await {
            let job_id = job.id;
            match self.process(job).await {
                Err(e) if e.category() != ErrorCategory::Stale => error!(
                    job_id = %job_id,
                    category = ?e.category(),
                    retriable = e.is_retriable(),
                    error = %e,
                    "rebuild job failed"
                ),
                _ => {}
            }
        }
        debug!("rebuild queue closed, worker stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(config_id: &str) -> RebuildJob {
        RebuildJob::new(
            &DataSourceConfig::new(config_id, "demo", "cases"),
            "config_report_demo_cases_00000000",
            vec![],
            DEFAULT_SOURCE,
        )
    }

    #[test]
    fn test_tracker_lifecycle() {
        let tracker = JobTracker::new();
        let job = job("abc");

        tracker.requested(&job);
        assert_eq!(tracker.get(job.id).unwrap().state, JobState::Requested);
        assert_eq!(tracker.pending(), 1);

        tracker.running(&job);
        assert!(tracker.get(job.id).unwrap().started_at.is_some());

        tracker.failed(job.id, &RebuildError::table_rebuild("t1", "lock timeout"));
        let status = tracker.get(job.id).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert!(status.error.unwrap().contains("lock timeout"));
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_channel_queue_closed() {
        let (queue, rx) = ChannelRebuildQueue::channel(1);
        drop(rx);
        let err = queue.enqueue(job("abc")).await.unwrap_err();
        assert!(matches!(err, RebuildError::QueueClosed));
    }

    #[tokio::test]
    async fn test_channel_queue_delivers() {
        let (queue, mut rx) = ChannelRebuildQueue::channel(4);
        let sent = job("abc");
        queue.enqueue(sent.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), sent);
    }
}
