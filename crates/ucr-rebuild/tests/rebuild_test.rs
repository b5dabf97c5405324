//! Rebuild jobs: queueing, execution and resumable builds

mod common;

use common::{case_doc, cases_config, Harness};
use serde_json::json;
use std::sync::Arc;
use ucr_rebuild::prelude::*;

fn worker(h: &Harness, source: MemoryDocumentSource, chunk_size: usize) -> RebuildWorker {
    let builder = IterativeBuilder::new(Arc::new(source), h.store.clone(), h.catalog.clone())
        .with_chunk_size(chunk_size);
    RebuildWorker::new(
        h.catalog.clone(),
        h.factory.clone(),
        Arc::new(builder),
        h.tracker.clone(),
        h.alerts.clone(),
    )
}

fn documents() -> MemoryDocumentSource {
    MemoryDocumentSource::with_documents([
        case_doc("c1", "demo", "alice"),
        case_doc("c2", "demo", "bob"),
        case_doc("c3", "elsewhere", "carol"),
    ])
}

/// Reconcile once and take the job the pass queued
async fn queued_job(h: &Harness, id: &str) -> RebuildJob {
    let adapter = h.adapter(id).await;
    let report = h.orchestrator.reconcile(&[adapter]).await;
    assert_eq!(report.rebuilds_queued.len(), 1);
    h.queue.jobs.lock()[0].clone()
}

// ==================== Worker Tests ====================

#[tokio::test]
async fn test_worker_rebuilds_and_loads_table() {
    let h = Harness::new(vec![cases_config("cases", "demo")]);
    let job = queued_job(&h, "cases").await;
    let worker = worker(&h, documents(), 1_000);

    let stats = worker.process(job.clone()).await.unwrap();

    assert_eq!(stats.units_built, 1);
    assert_eq!(stats.load.documents, 2);
    assert_eq!(stats.load.rows_inserted, 2);
    assert!(stats.marked_finished);

    assert_eq!(h.db.statements_matching("DROP TABLE").len(), 1);
    assert_eq!(h.db.statements_matching("CREATE TABLE").len(), 1);
    assert_eq!(h.db.statements_matching("INSERT").len(), 2);

    assert_eq!(h.tracker.get(job.id).unwrap().state, JobState::Completed);
    let config = h.catalog.get("cases").await.unwrap().unwrap();
    assert!(config.build.initiated.is_some());
    assert!(config.build.finished);
    assert!(!config.build.rebuilt_asynchronously);

    let helper = ResumeHelper::new(h.store.clone(), &config);
    assert!(!helper.has_resume_state().await.unwrap());
    assert_eq!(h.alerts.len(), 0);
}

#[tokio::test]
async fn test_worker_loads_in_chunks() {
    let h = Harness::new(vec![cases_config("cases", "demo")]);
    let job = queued_job(&h, "cases").await;
    let worker = worker(&h, documents(), 1);

    worker.process(job).await.unwrap();

    // One transaction for the DDL, one per chunk
    let begins = h.db.statements().iter().filter(|s| *s == "BEGIN").count();
    assert_eq!(begins, 3);
}

#[tokio::test]
async fn test_stale_job_fails_without_alert() {
    let h = Harness::new(vec![cases_config("cases", "demo")]);
    let job = queued_job(&h, "cases").await;
    h.catalog.update("cases", |c| c.display_name = Some("Cases".into())).unwrap();
    let worker = worker(&h, documents(), 1_000);

    let err = worker.process(job.clone()).await.unwrap_err();

    assert!(matches!(err, RebuildError::StaleRebuild { .. }));
    assert_eq!(err.category(), ErrorCategory::Stale);
    assert_eq!(h.tracker.get(job.id).unwrap().state, JobState::Failed);
    assert_eq!(h.alerts.len(), 0);
    assert!(h.db.statements_matching("DROP TABLE").is_empty());
}

#[tokio::test]
async fn test_failed_ddl_alerts_operators() {
    let h = Harness::new(vec![cases_config("cases", "demo")]);
    let job = queued_job(&h, "cases").await;
    h.db.fail_on("CREATE TABLE");
    let worker = worker(&h, documents(), 1_000);

    let err = worker.process(job.clone()).await.unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Rebuild);
    assert!(h.db.statements().contains(&"ROLLBACK".to_string()));
    let status = h.tracker.get(job.id).unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert!(status.error.is_some());

    let alerts = h.alerts.alerts.lock();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].0.contains(&job.table));
    assert_eq!(alerts[0].1["config"]["id"], json!("cases"));
}

#[tokio::test]
async fn test_worker_drains_channel_queue() {
    let h = Harness::new(vec![cases_config("cases", "demo")]);
    let job = queued_job(&h, "cases").await;
    let worker = worker(&h, documents(), 1_000);

    let (queue, jobs) = ChannelRebuildQueue::channel(4);
    queue.enqueue(job.clone()).await.unwrap();
    drop(queue);
    worker.run(jobs).await;

    assert_eq!(h.tracker.get(job.id).unwrap().state, JobState::Completed);
    let statuses = h.tracker.statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(h.tracker.pending(), 0);
}

// ==================== Builder Tests ====================

fn unit_doc(id: &str, case_type: &str) -> Document {
    Document::new(id, "demo", "CommCareCase", json!({"type": case_type, "owner": id}))
}

fn units_config() -> DataSourceConfig {
    cases_config("cases", "demo").with_units(["patient", "household"])
}

#[tokio::test]
async fn test_resume_skips_completed_units() {
    let h = Harness::new(vec![units_config()]);
    let adapter = h.adapter("cases").await;
    let source = MemoryDocumentSource::with_documents([
        unit_doc("p1", "patient"),
        unit_doc("p2", "patient"),
        unit_doc("h1", "household"),
    ]);
    let builder = IterativeBuilder::new(Arc::new(source), h.store.clone(), h.catalog.clone());
    builder
        .resume_helper(adapter.config())
        .add_completed_unit("demo", Some("patient"))
        .await
        .unwrap();

    let stats = builder.resume(adapter.as_ref()).await.unwrap();

    assert_eq!(stats.units_skipped, 1);
    assert_eq!(stats.units_built, 1);
    assert_eq!(stats.load.documents, 1);
    assert!(h.db.statements_matching("CREATE TABLE").is_empty());
    assert!(!builder.resume_helper(adapter.config()).has_resume_state().await.unwrap());
}

#[tokio::test]
async fn test_full_rebuild_ignores_leftover_markers() {
    let h = Harness::new(vec![units_config()]);
    let adapter = h.adapter("cases").await;
    let source = MemoryDocumentSource::with_documents([
        unit_doc("p1", "patient"),
        unit_doc("p2", "patient"),
        unit_doc("h1", "household"),
    ]);
    let builder = IterativeBuilder::new(Arc::new(source), h.store.clone(), h.catalog.clone());
    builder
        .resume_helper(adapter.config())
        .add_completed_unit("demo", Some("patient"))
        .await
        .unwrap();

    let stats = builder.rebuild(adapter.as_ref()).await.unwrap();

    assert_eq!(stats.units_skipped, 0);
    assert_eq!(stats.units_built, 2);
    assert_eq!(stats.load.documents, 3);
    assert!(stats.marked_finished);
    assert_eq!(h.db.statements_matching("INSERT").len(), 3);
    assert!(!builder.resume_helper(adapter.config()).has_resume_state().await.unwrap());
}

#[tokio::test]
async fn test_limit_applies_per_unit() {
    let h = Harness::new(vec![units_config()]);
    let adapter = h.adapter("cases").await;
    let source = MemoryDocumentSource::with_documents([
        unit_doc("p1", "patient"),
        unit_doc("p2", "patient"),
        unit_doc("h1", "household"),
        unit_doc("h2", "household"),
    ]);
    let builder = IterativeBuilder::new(Arc::new(source), h.store.clone(), h.catalog.clone())
        .with_limit(Some(1));

    let stats = builder.rebuild(adapter.as_ref()).await.unwrap();

    assert_eq!(stats.units_built, 2);
    assert_eq!(stats.load.documents, 2);
}

#[tokio::test]
async fn test_in_place_build_keeps_table() {
    let config = cases_config("cases", "demo");
    let h = Harness::new(vec![config.clone()]);
    h.db.deploy(&config);
    let adapter = h.adapter("cases").await;
    let builder = IterativeBuilder::new(Arc::new(documents()), h.store.clone(), h.catalog.clone());

    let stats = builder.rebuild_in_place(adapter.as_ref()).await.unwrap();

    assert!(stats.marked_finished);
    assert!(h.db.statements_matching("DROP TABLE").is_empty());
    let config = h.catalog.get("cases").await.unwrap().unwrap();
    assert!(config.build.initiated_in_place.is_some());
    assert!(config.build.finished_in_place);
    assert!(!config.build.finished);
}

#[tokio::test]
async fn test_static_build_leaves_catalog_alone() {
    let config = cases_config("static-demo-cases", "demo");
    let h = Harness::new(vec![]);
    let adapter = h.factory.build(&config).unwrap();
    let builder = IterativeBuilder::new(Arc::new(documents()), h.store.clone(), h.catalog.clone());

    let stats = builder.rebuild(adapter.as_ref()).await.unwrap();

    assert_eq!(stats.load.documents, 2);
    assert!(!stats.marked_finished);
    assert!(h.catalog.get("static-demo-cases").await.unwrap().is_none());
}
