//! Backend selection and the document-index adapters

mod common;

use async_trait::async_trait;
use common::{case_doc, cases_config, connections, FakeDb, Harness};
use std::sync::Arc;
use ucr_rebuild::definition::Backend;
use ucr_rebuild::prelude::*;

/// Index whose every call fails
struct UnreachableIndex;

#[async_trait]
impl DocumentIndex for UnreachableIndex {
    async fn index_exists(&self, _index: &str) -> Result<bool> {
        Err(RebuildError::store("index unreachable"))
    }

    async fn create_index(&self, _index: &str) -> Result<()> {
        Err(RebuildError::store("index unreachable"))
    }

    async fn delete_index(&self, _index: &str) -> Result<()> {
        Err(RebuildError::store("index unreachable"))
    }

    async fn put(&self, _index: &str, _id: &str, _body: serde_json::Value) -> Result<()> {
        Err(RebuildError::store("index unreachable"))
    }

    async fn remove(&self, _index: &str, _id: &str) -> Result<()> {
        Err(RebuildError::store("index unreachable"))
    }
}

fn factory_with_index(db: &FakeDb, index: Arc<MemoryDocumentIndex>) -> AdapterFactory {
    AdapterFactory::new(
        connections(db),
        Arc::new(DefaultDefinitionProvider),
        Arc::new(JsonFieldProducer),
    )
    .with_document_index(index)
}

#[test]
fn test_index_backend_needs_document_index() {
    let h = Harness::new(vec![]);
    let config = cases_config("cases", "demo").with_backend(Backend::Es);

    let err = h.factory.build(&config).err().unwrap();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

#[tokio::test]
async fn test_laboratory_writes_both_backends() {
    let db = FakeDb::new();
    let index = Arc::new(MemoryDocumentIndex::new());
    let config = cases_config("cases", "demo").with_backend(Backend::Laboratory);
    db.deploy(&config);
    let adapter = factory_with_index(&db, index.clone()).build(&config).unwrap();

    let outcome = adapter.save_document(&case_doc("c1", "demo", "alice")).await.unwrap();

    assert_eq!(outcome, SaveOutcome::Saved(1));
    assert_eq!(db.statements_matching("INSERT").len(), 1);
    let stored = index.get(adapter.table_name(), "c1").unwrap();
    assert_eq!(stored["rows"][0]["owner"], "alice");
    assert!(adapter.is_schema_managed());
}

#[tokio::test]
async fn test_laboratory_candidate_failure_is_hidden() {
    let db = FakeDb::new();
    let config = cases_config("cases", "demo");
    db.deploy(&config);
    let factory = factory_with_index(&db, Arc::new(MemoryDocumentIndex::new()));
    let primary = Arc::new(factory.build_sql(&config).unwrap());
    let candidate = Arc::new(EsIndicatorAdapter::new(
        config.clone(),
        primary.definition().clone(),
        Arc::new(UnreachableIndex),
        Arc::new(JsonFieldProducer),
    ));
    let adapter = LaboratoryAdapter::new(primary, candidate);

    let outcome = adapter.save_document(&case_doc("c1", "demo", "alice")).await.unwrap();

    assert_eq!(outcome, SaveOutcome::Saved(1));
    assert_eq!(db.statements_matching("INSERT").len(), 1);
    adapter.delete("c1").await.unwrap();
}

#[tokio::test]
async fn test_index_adapters_are_not_reconciled() {
    let config = cases_config("cases", "demo").with_backend(Backend::Es);
    let h = Harness::new(vec![config.clone()]);
    let index = Arc::new(MemoryDocumentIndex::new());
    let adapter = factory_with_index(&h.db, index.clone()).build(&config).unwrap();

    let report = h.orchestrator.reconcile(&[adapter.clone()]).await;

    assert_eq!(report.engines, 0);
    assert!(report.rebuilds_queued.is_empty());
    assert!(h.db.statements().is_empty());

    adapter.rebuild_table().await.unwrap();
    assert!(adapter.table_exists().await.unwrap());
    assert_eq!(index.count(adapter.table_name()), 0);
}

#[tokio::test]
async fn test_failed_save_rolls_back_its_transaction() {
    let db = FakeDb::new();
    let config = cases_config("cases", "demo");
    db.deploy(&config);
    let adapter = factory_with_index(&db, Arc::new(MemoryDocumentIndex::new()))
        .build_sql(&config)
        .unwrap();
    db.fail_on("DELETE FROM");

    let result = adapter.save_document(&case_doc("c1", "demo", "alice")).await;

    assert!(result.is_err());
    assert_eq!(db.statements(), vec!["BEGIN".to_string(), "ROLLBACK".to_string()]);
}
