//! Rebuild-versus-migrate classification
//!
//! Destructive or structural changes force a full rebuild; additive changes
//! are migrated in place. A table is never in both sets, and a table whose
//! only net change is an index on a hand-managed column is in neither.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::warn;

use crate::definition::INSERTED_AT_COLUMN;
use crate::diff::{DiffKind, SchemaDiff};

/// Kinds that require dropping and recreating the table
pub const REBUILD_KINDS: &[DiffKind] = &[
    DiffKind::AddTable,
    DiffKind::RemoveTable,
    DiffKind::AddColumn,
    DiffKind::RemoveColumn,
    DiffKind::ModifyType,
    DiffKind::ModifyNullable,
];

/// Kinds that can be applied to a live table
pub const MIGRATE_KINDS: &[DiffKind] = &[
    DiffKind::AddNullableColumn,
    DiffKind::AddIndex,
    DiffKind::RemoveIndex,
];

/// Result of classification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationPlan {
    /// Tables to rebuild, with all their diffs
    pub rebuild: BTreeMap<String, Vec<SchemaDiff>>,
    /// Tables to migrate, with the net diffs to apply
    pub migrate: BTreeMap<String, Vec<SchemaDiff>>,
}

impl MigrationPlan {
    /// Names of tables to rebuild
    pub fn tables_to_rebuild(&self) -> BTreeSet<&str> {
        self.rebuild.keys().map(String::as_str).collect()
    }

    /// Names of tables to migrate
    pub fn tables_to_migrate(&self) -> BTreeSet<&str> {
        self.migrate.keys().map(String::as_str).collect()
    }

    /// Nothing to do
    pub fn is_empty(&self) -> bool {
        self.rebuild.is_empty() && self.migrate.is_empty()
    }
}

/// Splits diffs into rebuild and migrate work
#[derive(Debug, Clone)]
pub struct MigrationClassifier {
    ignored_index_columns: HashSet<String>,
}

impl Default for MigrationClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationClassifier {
    /// Classifier ignoring index-only changes on `inserted_at`
    pub fn new() -> Self {
        Self::with_ignored_index_columns([INSERTED_AT_COLUMN])
    }

    /// Classifier with a custom set of hand-managed index columns
    pub fn with_ignored_index_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ignored_index_columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Classify a pass's diffs
    pub fn classify(&self, diffs: &[SchemaDiff]) -> MigrationPlan {
        let mut by_table: BTreeMap<&str, Vec<&SchemaDiff>> = BTreeMap::new();
        for diff in diffs {
            if let Some(table) = diff.table_name() {
                by_table.entry(table).or_default().push(diff);
            }
        }

        let mut plan = MigrationPlan::default();
        for (table, table_diffs) in by_table {
            if table_diffs.iter().any(|d| REBUILD_KINDS.contains(&d.kind())) {
                plan.rebuild
                    .insert(table.to_string(), table_diffs.into_iter().cloned().collect());
                continue;
            }

            let net = self.net_migrations(table, &table_diffs);
            if net.is_empty() || self.only_ignored_indexes(&net) {
                continue;
            }
            plan.migrate.insert(table.to_string(), net);
        }
        plan
    }

    /// Actionable diffs after cancelling symmetric index add/remove pairs
    fn net_migrations(&self, table: &str, diffs: &[&SchemaDiff]) -> Vec<SchemaDiff> {
        let mut index_groups: BTreeMap<Vec<String>, Vec<&SchemaDiff>> = BTreeMap::new();
        let mut net = Vec::new();

        for diff in diffs {
            match diff.index() {
                Some(index) => index_groups
                    .entry(index.columns.clone())
                    .or_default()
                    .push(*diff),
                None if MIGRATE_KINDS.contains(&diff.kind()) => net.push((*diff).clone()),
                None => {}
            }
        }

        for (columns, group) in index_groups {
            let adds = group.iter().filter(|d| d.kind() == DiffKind::AddIndex).count();
            let removes = group.len() - adds;
            if adds == 1 && removes == 1 {
                continue;
            }
            if group.len() > 2 {
                warn!(
                    table,
                    columns = ?columns,
                    diffs = group.len(),
                    "possible duplicate indexes, leaving for manual resolution"
                );
            }
            net.extend(group.into_iter().cloned());
        }
        net
    }

    fn only_ignored_indexes(&self, net: &[SchemaDiff]) -> bool {
        net.iter().all(|d| match d.index() {
            Some(index) => index
                .columns
                .iter()
                .all(|c| self.ignored_index_columns.contains(c)),
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ucr_rdbc::schema::IndexMetadata;
    use ucr_rdbc::types::ColumnMetadata;

    fn add_index(table: &str, name: &str, columns: &[&str]) -> SchemaDiff {
        SchemaDiff::AddIndex {
            table: table.into(),
            index: IndexMetadata::new(table, name, columns.iter().map(|c| c.to_string()).collect()),
        }
    }

    fn remove_index(table: &str, name: &str, columns: &[&str]) -> SchemaDiff {
        SchemaDiff::RemoveIndex {
            table: table.into(),
            index: IndexMetadata::new(table, name, columns.iter().map(|c| c.to_string()).collect()),
        }
    }

    #[test]
    fn test_symmetric_index_pair_cancels() {
        let diffs = vec![
            remove_index("t1", "ix_a_old", &["a"]),
            add_index("t1", "ix_a", &["a"]),
        ];
        assert!(MigrationClassifier::new().classify(&diffs).is_empty());
    }

    #[test]
    fn test_ignored_index_with_real_change_still_migrates() {
        let diffs = vec![
            add_index("t1", "ix_t1_inserted_at", &["inserted_at"]),
            SchemaDiff::AddNullableColumn {
                table: "t1".into(),
                column: ColumnMetadata::new("owner", "text"),
            },
        ];
        let plan = MigrationClassifier::new().classify(&diffs);
        assert_eq!(plan.migrate["t1"].len(), 2);
    }

    #[test]
    fn test_custom_ignored_columns() {
        let diffs = vec![add_index("t1", "ix_t1_modified_on", &["modified_on"])];
        assert!(!MigrationClassifier::new().classify(&diffs).is_empty());
        assert!(MigrationClassifier::with_ignored_index_columns(["modified_on"])
            .classify(&diffs)
            .is_empty());
    }

    #[test]
    fn test_duplicate_indexes_are_kept() {
        let diffs = vec![
            add_index("t1", "ix_a_1", &["a"]),
            add_index("t1", "ix_a_2", &["a"]),
            remove_index("t1", "ix_a_3", &["a"]),
        ];
        let plan = MigrationClassifier::new().classify(&diffs);
        assert_eq!(plan.migrate["t1"].len(), 3);
    }

    #[test]
    fn test_inert_diffs_are_noop() {
        let diffs = vec![
            SchemaDiff::ModifyDefault {
                table: "t1".into(),
                column: "a".into(),
                existing: Some("0".into()),
                expected: None,
            },
            SchemaDiff::Untyped {
                table: Some("t2".into()),
                op: "rename_table".into(),
            },
            SchemaDiff::AddConstraint {
                table: "t3".into(),
                constraint: "t3_pkey".into(),
            },
        ];
        assert!(MigrationClassifier::new().classify(&diffs).is_empty());
    }
}
