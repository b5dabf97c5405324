//! Reconciliation passes over a fake engine

mod common;

use common::{cases_config, Harness};
use ucr_rebuild::prelude::*;

fn owner_only(id: &str) -> DataSourceConfig {
    DataSourceConfig::new(id, "demo", "cases")
        .with_column(ColumnDef::new("owner", Datatype::String))
}

fn on_table(mut config: DataSourceConfig, table_id: &str) -> DataSourceConfig {
    config.table_id = table_id.to_string();
    config
}

// ==================== Migration Tests ====================

#[tokio::test]
async fn test_nullable_column_add_is_migrated() {
    let h = Harness::new(vec![cases_config("cases", "demo")]);
    h.db.deploy(&owner_only("cases"));
    let adapter = h.adapter("cases").await;

    let report = h.orchestrator.reconcile(&[adapter.clone()]).await;

    assert!(!report.has_failures());
    assert!(report.rebuilds_queued.is_empty());
    assert_eq!(report.migrated.len(), 1);
    assert_eq!(report.migrated[adapter.table_name()][0].kind, DiffKind::AddNullableColumn);

    let alters = h.db.statements_matching("ADD COLUMN");
    assert_eq!(alters.len(), 1);
    assert!(alters[0].contains("visits"));
    let statements = h.db.statements();
    assert_eq!(statements.first().map(String::as_str), Some("BEGIN"));
    assert_eq!(statements.last().map(String::as_str), Some("COMMIT"));

    let entries = h.audit.entries("cases").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].source, "ucr-rebuild");
    assert!(h.queue.tables().is_empty());
}

#[tokio::test]
async fn test_failed_migration_rolls_back_and_alerts() {
    let h = Harness::new(vec![cases_config("cases", "demo")]);
    h.db.deploy(&owner_only("cases"));
    h.db.fail_on("ADD COLUMN");
    let adapter = h.adapter("cases").await;

    let report = h.orchestrator.reconcile(&[adapter]).await;

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].engine_id, "default");
    assert_eq!(report.failures[0].category, ErrorCategory::Database);
    assert!(!report.failures[0].retriable);
    assert!(report.migrated.is_empty());
    assert!(h.db.statements().contains(&"ROLLBACK".to_string()));
    assert_eq!(h.alerts.len(), 1);
    assert!(h.audit.entries("cases").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_inserted_at_index_is_ignored() {
    let config = cases_config("cases", "demo");
    let h = Harness::new(vec![config.clone()]);
    let definition = DefaultDefinitionProvider.definition(&config).unwrap();
    h.db.put_table(definition.to_table_metadata(), vec![]);
    let adapter = h.adapter("cases").await;

    let report = h.orchestrator.reconcile(&[adapter]).await;

    assert_eq!(report.tables, 1);
    assert!(report.migrated.is_empty());
    assert!(report.rebuilds_queued.is_empty());
    assert!(h.db.statements().is_empty());
}

#[tokio::test]
async fn test_up_to_date_table_is_left_alone() {
    let config = cases_config("cases", "demo");
    let h = Harness::new(vec![config.clone()]);
    h.db.deploy(&config);
    let adapter = h.adapter("cases").await;

    let report = h.orchestrator.reconcile(&[adapter]).await;

    assert_eq!(report.engines, 1);
    assert_eq!(report, ReconcileReport { engines: 1, tables: 1, ..Default::default() });
    assert!(h.db.statements().is_empty());
}

// ==================== Rebuild Tests ====================

#[tokio::test]
async fn test_removed_column_queues_rebuild() {
    let h = Harness::new(vec![owner_only("cases")]);
    h.db.deploy(&cases_config("cases", "demo"));
    let adapter = h.adapter("cases").await;

    let report = h.orchestrator.reconcile(&[adapter.clone()]).await;

    assert_eq!(h.queue.tables(), vec![adapter.table_name().to_string()]);
    let job_id = report.rebuilds_queued[adapter.table_name()];
    let status = h.tracker.get(job_id).unwrap();
    assert_eq!(status.state, JobState::Requested);
    assert_eq!(status.config_id, "cases");

    let jobs = h.queue.jobs.lock();
    assert_eq!(jobs[0].revision, "1");
    assert_eq!(jobs[0].diffs[0].kind, DiffKind::RemoveColumn);
}

#[tokio::test]
async fn test_missing_table_queues_rebuild() {
    let h = Harness::new(vec![cases_config("cases", "demo")]);
    let adapter = h.adapter("cases").await;

    let report = h.orchestrator.reconcile(&[adapter]).await;

    assert_eq!(report.rebuilds_queued.len(), 1);
    assert!(report.migrated.is_empty());
}

#[tokio::test]
async fn test_stale_configuration_is_not_rebuilt() {
    let h = Harness::new(vec![cases_config("cases", "demo")]);
    let adapter = h.adapter("cases").await;
    h.catalog
        .update("cases", |c| c.display_name = Some("Cases".into()))
        .unwrap();

    let report = h.orchestrator.reconcile(&[adapter.clone()]).await;

    assert_eq!(report.stale, vec![adapter.table_name().to_string()]);
    assert!(h.queue.tables().is_empty());
    assert!(!report.has_failures());
    assert_eq!(h.alerts.len(), 0);
}

#[tokio::test]
async fn test_disabled_destructive_rebuild_is_skipped_and_audited() {
    let config = owner_only("cases").with_destructive_rebuild_disabled();
    let h = Harness::new(vec![config]);
    h.db.deploy(&cases_config("cases", "demo"));
    let adapter = h.adapter("cases").await;

    let report = h.orchestrator.reconcile(&[adapter.clone()]).await;

    assert_eq!(report.rebuilds_skipped, vec![adapter.table_name().to_string()]);
    assert!(h.queue.tables().is_empty());
    let entries = h.audit.entries("cases").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].source, "ucr-rebuild:rebuild-skipped");
}

#[tokio::test]
async fn test_disabled_destructive_rebuild_still_builds_missing_table() {
    let config = cases_config("cases", "demo").with_destructive_rebuild_disabled();
    let h = Harness::new(vec![config]);
    let adapter = h.adapter("cases").await;

    let report = h.orchestrator.reconcile(&[adapter]).await;

    assert_eq!(report.rebuilds_queued.len(), 1);
    assert!(report.rebuilds_skipped.is_empty());
}

// ==================== Filtering Tests ====================

#[tokio::test]
async fn test_deactivated_configuration_is_dropped() {
    let h = Harness::new(vec![cases_config("cases", "demo")]);
    let adapter = h.adapter("cases").await;
    h.catalog.deactivate("cases").unwrap();

    let report = h.orchestrator.reconcile(&[adapter]).await;

    assert_eq!(report.inactive, vec!["cases".to_string()]);
    assert_eq!(report.engines, 0);
    assert!(h.queue.tables().is_empty());
}

#[tokio::test]
async fn test_deleted_configuration_is_dropped() {
    let h = Harness::new(vec![cases_config("cases", "demo")]);
    let adapter = h.adapter("cases").await;
    h.catalog.remove("cases");

    let report = h.orchestrator.reconcile(&[adapter]).await;

    assert_eq!(report.inactive, vec!["cases".to_string()]);
}

#[tokio::test]
async fn test_static_configuration_skips_catalog_check() {
    let config = cases_config("static-demo-cases", "demo");
    let h = Harness::new(vec![]);
    h.db.deploy(&config);
    let adapter = h.factory.build(&config).unwrap();

    let report = h.orchestrator.reconcile(&[adapter]).await;

    assert!(report.inactive.is_empty());
    assert_eq!(report.tables, 1);
}

#[tokio::test]
async fn test_rebuild_and_migrate_in_one_pass() {
    let h = Harness::new(vec![
        owner_only("cases"),
        on_table(cases_config("visits", "demo"), "visits"),
    ]);
    h.db.deploy(&cases_config("cases", "demo"));
    h.db.deploy(&on_table(owner_only("visits"), "visits"));
    let rebuilt = h.adapter("cases").await;
    let migrated = h.adapter("visits").await;
    assert_ne!(rebuilt.table_name(), migrated.table_name());

    let report = h.orchestrator.reconcile(&[rebuilt.clone(), migrated.clone()]).await;

    assert_eq!(report.tables, 2);
    assert!(report.rebuilds_queued.contains_key(rebuilt.table_name()));
    assert!(!report.migrated.contains_key(rebuilt.table_name()));
    assert!(report.migrated.contains_key(migrated.table_name()));
    assert!(h.audit.entries("cases").await.unwrap().is_empty());
    assert_eq!(h.audit.entries("visits").await.unwrap().len(), 1);
}

// ==================== Planning Tests ====================

#[tokio::test]
async fn test_plan_lists_operator_statements_without_executing() {
    let config = cases_config("cases", "demo").with_index(IndexDef::on(&["owner"]));
    let h = Harness::new(vec![config]);
    h.db.deploy(&cases_config("cases", "demo"));
    let adapter = h.adapter("cases").await;

    let plans = h.orchestrator.plan(&[adapter.clone()]).await.unwrap();

    assert_eq!(plans.len(), 1);
    let plan = &plans[0];
    assert_eq!(plan.engine_id, "default");
    assert!(plan.rebuild.is_empty());
    assert_eq!(plan.migrate[adapter.table_name()][0].kind, DiffKind::AddIndex);
    assert_eq!(plan.operator_statements.len(), 1);
    assert!(plan.operator_statements[0].starts_with("CREATE INDEX CONCURRENTLY"));
    assert!(h.db.statements().is_empty());
}
