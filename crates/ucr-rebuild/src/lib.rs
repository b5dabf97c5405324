//! # ucr-rebuild
//!
//! Keeps user-configurable report tables in line with their data source
//! definitions while documents keep flowing into them.
//!
//! ## Features
//!
//! - **Schema diffing**: live tables versus expected layout, as a closed set
//!   of typed diffs with an untyped fallback
//! - **Classification**: destructive changes rebuild, additive changes migrate
//!   in place, and a table is never in both
//! - **Migrations**: nullable column adds in one transaction; index changes
//!   logged as `CONCURRENTLY` statements for an operator
//! - **Asynchronous rebuilds**: staleness-checked jobs, a job tracker and
//!   operator alerts on failure
//! - **Resumable builds**: per-revision progress markers in a shared list
//! - **Task coordination**: one winner per interval across all workers
//! - **Change processing**: per-domain routing of document changes with
//!   slow-save logging
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ucr_rebuild::prelude::*;
//!
//! let (queue, jobs) = ChannelRebuildQueue::channel(64);
//! let tracker = Arc::new(JobTracker::new());
//! let rebuilder = TableRebuilder::new(catalog.clone(), Arc::new(queue), tracker);
//! let orchestrator = RebuildOrchestrator::new(catalog, connections, rebuilder, audit, alerts);
//!
//! let report = orchestrator.reconcile(&adapters).await;
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` (default) - tokio-postgres backend for engine connections

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapter;
pub mod audit;
pub mod build;
pub mod catalog;
pub mod classify;
pub mod clock;
pub mod config;
pub mod connections;
pub mod coordinator;
pub mod definition;
pub mod diff;
pub mod error;
pub mod filter;
pub mod loader;
pub mod migrate;
pub mod notify;
pub mod orchestrator;
pub mod processor;
pub mod producer;
pub mod rebuild;
pub mod resume;
pub mod store;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::adapter::{
        AdapterFactory, DocumentIndex, EsIndicatorAdapter, IndicatorAdapter, LaboratoryAdapter,
        MemoryDocumentIndex, SaveOutcome, SqlIndicatorAdapter,
    };
    pub use crate::audit::{AuditEntry, AuditLog, StoreAuditLog};
    pub use crate::build::{BuildStats, DocumentSource, IterativeBuilder, MemoryDocumentSource};
    pub use crate::catalog::{ConfigStore, MemoryConfigStore};
    pub use crate::classify::{MigrationClassifier, MigrationPlan};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{
        BuildConfig, ClassifierConfig, CoordinatorConfig, ProcessorConfig, RebuildConfig,
    };
    pub use crate::connections::{ConnectionManager, EngineHandle};
    pub use crate::coordinator::TaskCoordinator;
    pub use crate::definition::{
        BuildInfo, ColumnDef, DataSourceConfig, Datatype, DefaultDefinitionProvider, IndexDef,
        TableDefinition, TableDefinitionProvider,
    };
    pub use crate::diff::{DiffKind, DiffSummary, SchemaDiff, SchemaDiffEngine};
    pub use crate::error::{ErrorCategory, RebuildError, Result};
    pub use crate::filter::ConfigFilter;
    pub use crate::migrate::TableMigrator;
    pub use crate::notify::{AlertSink, Notifier};
    pub use crate::orchestrator::{EnginePlan, RebuildOrchestrator, ReconcileReport};
    pub use crate::processor::{ChangeEvent, ChangeOutcome, TableManager};
    pub use crate::producer::{Document, JsonFieldProducer, RowProducer};
    pub use crate::rebuild::{
        ChannelRebuildQueue, JobState, JobTracker, RebuildDecision, RebuildJob, RebuildQueue,
        RebuildWorker, TableRebuilder,
    };
    pub use crate::resume::ResumeHelper;
    pub use crate::store::{ListStore, MemoryStore, SharedCache};
}

pub use error::{RebuildError as Error, Result};

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let _classifier = MigrationClassifier::new();
        let _config = RebuildConfig::default();
        let _store = MemoryStore::new();
    }

    #[test]
    fn test_error_types() {
        let err = RebuildError::config("bad division");
        assert!(!err.is_retriable());
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }
}
