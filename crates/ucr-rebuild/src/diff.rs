//! Schema diffing between deployed tables and their definitions
//!
//! Comparison happens in two steps:
//!
//! 1. [`compare_schemas`] walks live and expected metadata and emits
//!    [`RawDiff`] records. These are loosely shaped (an op name plus optional
//!    payload) and may also arrive from elsewhere, e.g. a serialized audit
//!    trail.
//! 2. [`reformat_diffs`] maps every raw record onto the closed [`SchemaDiff`]
//!    sum type. Records it cannot interpret become [`SchemaDiff::Untyped`]
//!    instead of failing the pass.
//!
//! [`SchemaDiffEngine`] runs both against a live connection for a set of
//! tables and never reports a diff outside that set.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use ucr_rdbc::dialect::{PostgresDialect, SqlDialect};
use ucr_rdbc::schema::{IndexMetadata, SchemaProvider};
use ucr_rdbc::types::{ColumnMetadata, TableMetadata};

use crate::definition::TableDefinition;
use crate::error::Result;

/// Introspected state of one table at the start of a pass
#[derive(Debug, Clone)]
pub struct LiveTableSchema {
    /// Columns and key
    pub table: TableMetadata,
    /// All indexes, including the primary key index
    pub indexes: Vec<IndexMetadata>,
}

/// Expected column and index layout of a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedTable {
    /// Columns and key
    pub table: TableMetadata,
    /// Secondary indexes
    pub indexes: Vec<IndexMetadata>,
}

/// Expected layout of every table sharing a connection
#[derive(Debug, Clone, Default)]
pub struct ExpectedSchema {
    tables: BTreeMap<String, ExpectedTable>,
}

impl ExpectedSchema {
    /// Empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table from its definition
    pub fn add_definition(&mut self, definition: &TableDefinition) {
        self.tables.insert(
            definition.table_name.clone(),
            ExpectedTable {
                table: definition.to_table_metadata(),
                indexes: definition.index_metadata(),
            },
        );
    }

    /// Add a table from raw metadata
    pub fn add_table(&mut self, table: TableMetadata, indexes: Vec<IndexMetadata>) {
        self.tables
            .insert(table.name.clone(), ExpectedTable { table, indexes });
    }

    /// Look up a table
    pub fn get(&self, name: &str) -> Option<&ExpectedTable> {
        self.tables.get(name)
    }

    /// Table names
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Number of tables
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether no table was added
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Loosely shaped diff record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDiff {
    /// Operation name, e.g. `add_column`
    pub op: String,
    /// Affected table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Column payload for column ops
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<ColumnMetadata>,
    /// Index payload for index ops
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexMetadata>,
    /// Deployed value for modify ops
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing: Option<String>,
    /// Expected value for modify ops
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    /// Constraint name for constraint ops
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<String>,
}

impl RawDiff {
    fn new(op: &str, table: &str) -> Self {
        Self {
            op: op.to_string(),
            table: Some(table.to_string()),
            ..Default::default()
        }
    }

    fn with_column(mut self, column: ColumnMetadata) -> Self {
        self.column = Some(column);
        self
    }

    fn with_index(mut self, index: IndexMetadata) -> Self {
        self.index = Some(index);
        self
    }

    fn with_values(mut self, existing: Option<String>, expected: Option<String>) -> Self {
        self.existing = existing;
        self.expected = expected;
        self
    }

    fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }
}

/// Closed set of diff kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    /// Table missing from the database
    AddTable,
    /// Table no longer defined
    RemoveTable,
    /// New NOT NULL column
    AddColumn,
    /// New nullable column
    AddNullableColumn,
    /// Column no longer defined
    RemoveColumn,
    /// Column type changed
    ModifyType,
    /// Column nullability changed
    ModifyNullable,
    /// Column default changed
    ModifyDefault,
    /// Index missing from the database
    AddIndex,
    /// Index no longer defined
    RemoveIndex,
    /// Constraint missing from the database
    AddConstraint,
    /// Constraint no longer defined
    RemoveConstraint,
    /// Unrecognized record
    Untyped,
}

impl DiffKind {
    /// Snake-case name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddTable => "add_table",
            Self::RemoveTable => "remove_table",
            Self::AddColumn => "add_column",
            Self::AddNullableColumn => "add_nullable_column",
            Self::RemoveColumn => "remove_column",
            Self::ModifyType => "modify_type",
            Self::ModifyNullable => "modify_nullable",
            Self::ModifyDefault => "modify_default",
            Self::AddIndex => "add_index",
            Self::RemoveIndex => "remove_index",
            Self::AddConstraint => "add_constraint",
            Self::RemoveConstraint => "remove_constraint",
            Self::Untyped => "untyped",
        }
    }
}

impl fmt::Display for DiffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structural difference of one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaDiff {
    /// Table missing from the database
    AddTable {
        /// Table
        table: String,
    },
    /// Table present but not defined
    RemoveTable {
        /// Table
        table: String,
    },
    /// New NOT NULL column
    AddColumn {
        /// Table
        table: String,
        /// Column to add
        column: ColumnMetadata,
    },
    /// New nullable column
    AddNullableColumn {
        /// Table
        table: String,
        /// Column to add
        column: ColumnMetadata,
    },
    /// Column present but not defined
    RemoveColumn {
        /// Table
        table: String,
        /// Column name
        column: String,
    },
    /// Column type differs
    ModifyType {
        /// Table
        table: String,
        /// Column name
        column: String,
        /// Deployed type
        existing: String,
        /// Expected type
        expected: String,
    },
    /// Column nullability differs
    ModifyNullable {
        /// Table
        table: String,
        /// Column name
        column: String,
        /// Deployed nullability
        existing: bool,
        /// Expected nullability
        expected: bool,
    },
    /// Column default differs
    ModifyDefault {
        /// Table
        table: String,
        /// Column name
        column: String,
        /// Deployed default
        existing: Option<String>,
        /// Expected default
        expected: Option<String>,
    },
    /// Index missing from the database
    AddIndex {
        /// Table
        table: String,
        /// Index to create
        index: IndexMetadata,
    },
    /// Index present but not defined
    RemoveIndex {
        /// Table
        table: String,
        /// Index to drop
        index: IndexMetadata,
    },
    /// Constraint missing from the database
    AddConstraint {
        /// Table
        table: String,
        /// Constraint name
        constraint: String,
    },
    /// Constraint present but not defined
    RemoveConstraint {
        /// Table
        table: String,
        /// Constraint name
        constraint: String,
    },
    /// Record that could not be interpreted
    Untyped {
        /// Table, when one could be read
        table: Option<String>,
        /// Original op name
        op: String,
    },
}

impl SchemaDiff {
    /// Kind tag
    pub fn kind(&self) -> DiffKind {
        match self {
            Self::AddTable { .. } => DiffKind::AddTable,
            Self::RemoveTable { .. } => DiffKind::RemoveTable,
            Self::AddColumn { .. } => DiffKind::AddColumn,
            Self::AddNullableColumn { .. } => DiffKind::AddNullableColumn,
            Self::RemoveColumn { .. } => DiffKind::RemoveColumn,
            Self::ModifyType { .. } => DiffKind::ModifyType,
            Self::ModifyNullable { .. } => DiffKind::ModifyNullable,
            Self::ModifyDefault { .. } => DiffKind::ModifyDefault,
            Self::AddIndex { .. } => DiffKind::AddIndex,
            Self::RemoveIndex { .. } => DiffKind::RemoveIndex,
            Self::AddConstraint { .. } => DiffKind::AddConstraint,
            Self::RemoveConstraint { .. } => DiffKind::RemoveConstraint,
            Self::Untyped { .. } => DiffKind::Untyped,
        }
    }

    /// Owning table
    pub fn table_name(&self) -> Option<&str> {
        match self {
            Self::AddTable { table }
            | Self::RemoveTable { table }
            | Self::AddColumn { table, .. }
            | Self::AddNullableColumn { table, .. }
            | Self::RemoveColumn { table, .. }
            | Self::ModifyType { table, .. }
            | Self::ModifyNullable { table, .. }
            | Self::ModifyDefault { table, .. }
            | Self::AddIndex { table, .. }
            | Self::RemoveIndex { table, .. }
            | Self::AddConstraint { table, .. }
            | Self::RemoveConstraint { table, .. } => Some(table),
            Self::Untyped { table, .. } => table.as_deref(),
        }
    }

    /// Index payload of index diffs
    pub fn index(&self) -> Option<&IndexMetadata> {
        match self {
            Self::AddIndex { index, .. } | Self::RemoveIndex { index, .. } => Some(index),
            _ => None,
        }
    }

    /// Affected column, index or constraint name
    pub fn item_name(&self) -> Option<&str> {
        match self {
            Self::AddColumn { column, .. } | Self::AddNullableColumn { column, .. } => {
                Some(&column.name)
            }
            Self::RemoveColumn { column, .. }
            | Self::ModifyType { column, .. }
            | Self::ModifyNullable { column, .. }
            | Self::ModifyDefault { column, .. } => Some(column),
            Self::AddIndex { index, .. } | Self::RemoveIndex { index, .. } => Some(&index.name),
            Self::AddConstraint { constraint, .. } | Self::RemoveConstraint { constraint, .. } => {
                Some(constraint)
            }
            Self::AddTable { .. } | Self::RemoveTable { .. } | Self::Untyped { .. } => None,
        }
    }

    /// Serializable summary for audit trails and alerts
    pub fn summary(&self) -> DiffSummary {
        DiffSummary {
            kind: self.kind(),
            table: self.table_name().map(String::from),
            item: self.item_name().map(String::from),
            columns: self.index().map(|ix| ix.columns.clone()),
        }
    }
}

impl fmt::Display for SchemaDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())?;
        if let Some(table) = self.table_name() {
            write!(f, " {}", table)?;
        }
        if let Some(item) = self.item_name() {
            write!(f, ".{}", item)?;
        }
        Ok(())
    }
}

/// Flat record of a diff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    /// Kind
    #[serde(rename = "type")]
    pub kind: DiffKind,
    /// Table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Column, index or constraint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    /// Index columns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
}

/// Compare live tables against their expected layout.
///
/// `live` holds the tables that exist; `tables` names every table under
/// consideration. A name with an expected layout but no live table yields
/// `add_table`, the reverse yields `remove_table`.
pub fn compare_schemas(
    tables: &[String],
    live: &[LiveTableSchema],
    expected: &ExpectedSchema,
    dialect: &dyn SqlDialect,
) -> Vec<RawDiff> {
    let live_by_name: BTreeMap<&str, &LiveTableSchema> =
        live.iter().map(|l| (l.table.name.as_str(), l)).collect();

    let mut diffs = Vec::new();
    for name in tables {
        match (live_by_name.get(name.as_str()), expected.get(name)) {
            (None, Some(_)) => diffs.push(RawDiff::new("add_table", name)),
            (Some(_), None) => diffs.push(RawDiff::new("remove_table", name)),
            (Some(live), Some(exp)) => {
                compare_columns(name, &live.table, &exp.table, dialect, &mut diffs);
                compare_keys(name, &live.table, &exp.table, &mut diffs);
                compare_indexes(name, &live.indexes, &exp.indexes, &mut diffs);
            }
            (None, None) => {}
        }
    }
    diffs
}

fn compare_columns(
    table: &str,
    live: &TableMetadata,
    expected: &TableMetadata,
    dialect: &dyn SqlDialect,
    diffs: &mut Vec<RawDiff>,
) {
    for column in &expected.columns {
        let Some(existing) = live.column(&column.name) else {
            diffs.push(RawDiff::new("add_column", table).with_column(column.clone()));
            continue;
        };

        let existing_type = dialect.canonical_type(&existing.type_name);
        let expected_type = dialect.canonical_type(&column.type_name);
        if existing_type != expected_type {
            diffs.push(
                RawDiff::new("modify_type", table)
                    .with_column(column.clone())
                    .with_values(Some(existing_type), Some(expected_type)),
            );
        }
        if existing.nullable != column.nullable {
            diffs.push(
                RawDiff::new("modify_nullable", table)
                    .with_column(column.clone())
                    .with_values(
                        Some(existing.nullable.to_string()),
                        Some(column.nullable.to_string()),
                    ),
            );
        }
        if existing.default_value != column.default_value {
            diffs.push(
                RawDiff::new("modify_default", table)
                    .with_column(column.clone())
                    .with_values(existing.default_value.clone(), column.default_value.clone()),
            );
        }
    }

    for column in &live.columns {
        if expected.column(&column.name).is_none() {
            diffs.push(RawDiff::new("remove_column", table).with_column(column.clone()));
        }
    }
}

fn compare_keys(
    table: &str,
    live: &TableMetadata,
    expected: &TableMetadata,
    diffs: &mut Vec<RawDiff>,
) {
    let key = |t: &TableMetadata| -> Vec<String> {
        t.primary_key_columns()
            .iter()
            .map(|c| c.name.to_lowercase())
            .collect()
    };
    let (live_key, expected_key) = (key(live), key(expected));
    if live_key == expected_key {
        return;
    }

    let constraint = format!("{}_pkey", table);
    if !live_key.is_empty() {
        diffs.push(RawDiff::new("remove_constraint", table).with_constraint(constraint.clone()));
    }
    if !expected_key.is_empty() {
        diffs.push(RawDiff::new("add_constraint", table).with_constraint(constraint));
    }
}

fn compare_indexes(
    table: &str,
    live: &[IndexMetadata],
    expected: &[IndexMetadata],
    diffs: &mut Vec<RawDiff>,
) {
    let live: BTreeMap<&str, &IndexMetadata> = live
        .iter()
        .filter(|ix| !ix.primary)
        .map(|ix| (ix.name.as_str(), ix))
        .collect();
    let expected: BTreeMap<&str, &IndexMetadata> =
        expected.iter().map(|ix| (ix.name.as_str(), ix)).collect();

    for (name, index) in &expected {
        match live.get(name) {
            None => diffs.push(RawDiff::new("add_index", table).with_index((*index).clone())),
            Some(existing) if existing.columns != index.columns => {
                diffs.push(RawDiff::new("remove_index", table).with_index((*existing).clone()));
                diffs.push(RawDiff::new("add_index", table).with_index((*index).clone()));
            }
            Some(_) => {}
        }
    }
    for (name, index) in &live {
        if !expected.contains_key(name) {
            diffs.push(RawDiff::new("remove_index", table).with_index((*index).clone()));
        }
    }
}

/// Map raw records onto [`SchemaDiff`]; anything unrecognized becomes
/// [`SchemaDiff::Untyped`]
pub fn reformat_diffs(raw: &[RawDiff]) -> Vec<SchemaDiff> {
    raw.iter().map(reformat_diff).collect()
}

fn reformat_diff(raw: &RawDiff) -> SchemaDiff {
    let untyped = || SchemaDiff::Untyped {
        table: raw.table.clone(),
        op: raw.op.clone(),
    };
    let Some(table) = raw.table.clone() else {
        return untyped();
    };
    let column_name = raw.column.as_ref().map(|c| c.name.clone());

    let diff = match raw.op.as_str() {
        "add_table" => Some(SchemaDiff::AddTable { table }),
        "remove_table" => Some(SchemaDiff::RemoveTable { table }),
        "add_column" => raw.column.clone().map(|column| {
            if column.nullable {
                SchemaDiff::AddNullableColumn { table, column }
            } else {
                SchemaDiff::AddColumn { table, column }
            }
        }),
        "remove_column" => column_name.map(|column| SchemaDiff::RemoveColumn { table, column }),
        "modify_type" => column_name.map(|column| SchemaDiff::ModifyType {
            table,
            column,
            existing: raw.existing.clone().unwrap_or_default(),
            expected: raw.expected.clone().unwrap_or_default(),
        }),
        "modify_nullable" => {
            let parse = |v: &Option<String>| v.as_deref().and_then(|s| s.parse::<bool>().ok());
            match (column_name, parse(&raw.existing), parse(&raw.expected)) {
                (Some(column), Some(existing), Some(expected)) => Some(SchemaDiff::ModifyNullable {
                    table,
                    column,
                    existing,
                    expected,
                }),
                _ => None,
            }
        }
        "modify_default" => column_name.map(|column| SchemaDiff::ModifyDefault {
            table,
            column,
            existing: raw.existing.clone(),
            expected: raw.expected.clone(),
        }),
        "add_index" => raw
            .index
            .clone()
            .map(|index| SchemaDiff::AddIndex { table, index }),
        "remove_index" => raw
            .index
            .clone()
            .map(|index| SchemaDiff::RemoveIndex { table, index }),
        "add_constraint" => raw
            .constraint
            .clone()
            .map(|constraint| SchemaDiff::AddConstraint { table, constraint }),
        "remove_constraint" => raw
            .constraint
            .clone()
            .map(|constraint| SchemaDiff::RemoveConstraint { table, constraint }),
        _ => None,
    };

    diff.unwrap_or_else(|| {
        debug!(op = %raw.op, table = ?raw.table, "unrecognized diff record");
        untyped()
    })
}

/// Diffs live tables on one connection against their expected layout
pub struct SchemaDiffEngine {
    provider: Arc<dyn SchemaProvider>,
    dialect: Arc<dyn SqlDialect>,
    schema: Option<String>,
}

impl SchemaDiffEngine {
    /// Engine over a schema provider, using the PostgreSQL dialect
    pub fn new(provider: Arc<dyn SchemaProvider>) -> Self {
        Self {
            provider,
            dialect: Arc::new(PostgresDialect),
            schema: None,
        }
    }

    /// Use a different dialect for type comparison
    pub fn with_dialect(mut self, dialect: Arc<dyn SqlDialect>) -> Self {
        self.dialect = dialect;
        self
    }

    /// Restrict introspection to a database schema
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Introspect the tables that exist among `tables`
    pub async fn introspect(&self, tables: &[String]) -> Result<Vec<LiveTableSchema>> {
        let schema = self.schema.as_deref();
        let mut live = Vec::with_capacity(tables.len());
        for name in tables {
            let Some(table) = self.provider.get_table(schema, name).await? else {
                continue;
            };
            let indexes = self.provider.list_indexes(schema, name).await?;
            live.push(LiveTableSchema { table, indexes });
        }
        Ok(live)
    }

    /// Raw diffs for `tables`, restricted to that set
    pub async fn raw_diffs(
        &self,
        tables: &[String],
        expected: &ExpectedSchema,
    ) -> Result<Vec<RawDiff>> {
        let live = self.introspect(tables).await?;
        let requested: HashSet<&str> = tables.iter().map(String::as_str).collect();

        let (kept, dropped): (Vec<_>, Vec<_>) =
            compare_schemas(tables, &live, expected, self.dialect.as_ref())
                .into_iter()
                .partition(|d| d.table.as_deref().is_some_and(|t| requested.contains(t)));
        if !dropped.is_empty() {
            warn!(count = dropped.len(), "ignoring diffs outside the requested tables");
        }
        Ok(kept)
    }

    /// Typed diffs for `tables`, restricted to that set
    pub async fn get_diffs(
        &self,
        tables: &[String],
        expected: &ExpectedSchema,
    ) -> Result<Vec<SchemaDiff>> {
        let raw = self.raw_diffs(tables, expected).await?;
        let diffs = reformat_diffs(&raw);
        debug!(tables = tables.len(), diffs = diffs.len(), "computed schema diffs");
        Ok(diffs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str, columns: Vec<ColumnMetadata>) -> TableMetadata {
        let mut t = TableMetadata::new(name);
        t.columns = columns;
        t
    }

    fn live(t: TableMetadata, indexes: Vec<IndexMetadata>) -> LiveTableSchema {
        LiveTableSchema { table: t, indexes }
    }

    fn kinds(diffs: &[SchemaDiff]) -> Vec<DiffKind> {
        diffs.iter().map(SchemaDiff::kind).collect()
    }

    #[test]
    fn test_add_and_remove_table() {
        let mut expected = ExpectedSchema::new();
        expected.add_table(table("t1", vec![ColumnMetadata::new("doc_id", "text")]), vec![]);

        let names = vec!["t1".to_string(), "t2".to_string()];
        let existing = vec![live(table("t2", vec![ColumnMetadata::new("a", "text")]), vec![])];
        let diffs =
            reformat_diffs(&compare_schemas(&names, &existing, &expected, &PostgresDialect));

        assert_eq!(kinds(&diffs), vec![DiffKind::AddTable, DiffKind::RemoveTable]);
    }

    #[test]
    fn test_nullable_add_is_distinguished() {
        let mut expected = ExpectedSchema::new();
        expected.add_table(
            table(
                "t1",
                vec![
                    ColumnMetadata::new("doc_id", "text"),
                    ColumnMetadata::new("a", "integer"),
                    ColumnMetadata::new("b", "integer").not_null(),
                ],
            ),
            vec![],
        );
        let existing = vec![live(table("t1", vec![ColumnMetadata::new("doc_id", "text")]), vec![])];
        let diffs = reformat_diffs(&compare_schemas(
            &["t1".to_string()],
            &existing,
            &expected,
            &PostgresDialect,
        ));

        assert_eq!(kinds(&diffs), vec![DiffKind::AddNullableColumn, DiffKind::AddColumn]);
    }

    #[test]
    fn test_type_aliases_do_not_diff() {
        let mut expected = ExpectedSchema::new();
        expected.add_table(table("t1", vec![ColumnMetadata::new("n", "integer")]), vec![]);
        let existing = vec![live(table("t1", vec![ColumnMetadata::new("n", "int4")]), vec![])];
        assert!(compare_schemas(&["t1".into()], &existing, &expected, &PostgresDialect).is_empty());

        let existing = vec![live(table("t1", vec![ColumnMetadata::new("n", "varchar")]), vec![])];
        let tables = ["t1".to_string()];
        let diffs =
            reformat_diffs(&compare_schemas(&tables, &existing, &expected, &PostgresDialect));
        assert_eq!(kinds(&diffs), vec![DiffKind::ModifyType]);
    }

    #[test]
    fn test_index_diffs_ignore_primary() {
        let mut expected = ExpectedSchema::new();
        expected.add_table(
            table("t1", vec![ColumnMetadata::new("doc_id", "text").with_primary_key(1)]),
            vec![IndexMetadata::new("t1", "ix_t1_inserted_at", vec!["inserted_at".into()])],
        );
        let existing = vec![live(
            table("t1", vec![ColumnMetadata::new("doc_id", "text").with_primary_key(1)]),
            vec![
                IndexMetadata::new("t1", "t1_pkey", vec!["doc_id".into()]).primary(),
                IndexMetadata::new("t1", "ix_old", vec!["owner".into()]),
            ],
        )];
        let tables = ["t1".to_string()];
        let diffs =
            reformat_diffs(&compare_schemas(&tables, &existing, &expected, &PostgresDialect));
        assert_eq!(kinds(&diffs), vec![DiffKind::AddIndex, DiffKind::RemoveIndex]);
    }

    #[test]
    fn test_unknown_shapes_are_untyped() {
        let raw = vec![
            RawDiff {
                op: "rename_table".into(),
                table: Some("t1".into()),
                ..Default::default()
            },
            RawDiff {
                op: "add_column".into(),
                table: Some("t1".into()),
                ..Default::default()
            },
            RawDiff {
                op: "add_table".into(),
                ..Default::default()
            },
        ];
        let diffs = reformat_diffs(&raw);
        assert!(diffs.iter().all(|d| d.kind() == DiffKind::Untyped));
        assert_eq!(diffs[0].table_name(), Some("t1"));
        assert_eq!(diffs[2].table_name(), None);
    }

    #[test]
    fn test_summary_serialization() {
        let diff = SchemaDiff::AddIndex {
            table: "t1".into(),
            index: IndexMetadata::new("t1", "ix_a", vec!["a".into()]),
        };
        let json = serde_json::to_value(diff.summary()).unwrap();
        assert_eq!(json["type"], "add_index");
        assert_eq!(json["item"], "ix_a");
        assert_eq!(diff.to_string(), "add_index t1.ix_a");
    }
}
