//! Data source configurations and the table definitions derived from them
//!
//! A [`DataSourceConfig`] is owned by the admin layer and versioned by its
//! revision. A [`TableDefinitionProvider`] turns it into the
//! [`TableDefinition`] that states what the physical table must look like.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ucr_rdbc::schema::IndexMetadata;
use ucr_rdbc::security::MAX_IDENTIFIER_LEN;
use ucr_rdbc::types::{ColumnMetadata, TableMetadata};

use crate::error::{RebuildError, Result};
use crate::resume::STATIC_REVISION;

/// Id prefix of built-in configurations
pub const STATIC_PREFIX: &str = "static-";

/// Prefix of every physical report table
pub const TABLE_PREFIX: &str = "config_report_";

/// Primary key column holding the source document id
pub const DOC_ID_COLUMN: &str = "doc_id";

/// Load timestamp column; its index is managed by hand
pub const INSERTED_AT_COLUMN: &str = "inserted_at";

/// Semantic column types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Datatype {
    /// Free text
    String,
    /// 32-bit integer
    Integer,
    /// 16-bit integer
    SmallInteger,
    /// 64-bit integer
    BigInteger,
    /// Exact numeric
    Decimal,
    /// Floating point
    Double,
    /// Boolean
    Boolean,
    /// Calendar date
    Date,
    /// Timestamp without zone
    DateTime,
    /// Array of text
    Array,
}

impl Datatype {
    /// Native SQL type name
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::String => "text",
            Self::Integer => "integer",
            Self::SmallInteger => "smallint",
            Self::BigInteger => "bigint",
            Self::Decimal => "numeric",
            Self::Double => "double precision",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::DateTime => "timestamp",
            Self::Array => "text[]",
        }
    }
}

/// One column of a report table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name
    pub name: String,
    /// Semantic type
    pub datatype: Datatype,
    /// Whether NULL is allowed
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Part of the primary key
    #[serde(default)]
    pub is_primary_key: bool,
}

fn default_true() -> bool {
    true
}

impl ColumnDef {
    /// Nullable column
    pub fn new(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            name: name.into(),
            datatype,
            nullable: true,
            is_primary_key: false,
        }
    }

    /// Disallow NULL
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Make part of the primary key
    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.nullable = false;
        self
    }
}

/// Index declared by a data source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Explicit name; derived from table and columns when absent
    #[serde(default)]
    pub name: Option<String>,
    /// Indexed columns, in order
    pub columns: Vec<String>,
}

impl IndexDef {
    /// Index on the given columns
    pub fn on(columns: &[&str]) -> Self {
        Self {
            name: None,
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Physical index name on `table`
    pub fn resolved_name(&self, table: &str) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let name = format!("ix_{}_{}", table, self.columns.join("_"));
        if name.len() <= MAX_IDENTIFIER_LEN {
            name
        } else {
            format!("ix_{}", short_hash(&name, 16))
        }
    }
}

/// Partition bucket width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionRule {
    /// One partition per day
    Day,
    /// One partition per month
    Month,
    /// One partition per year
    Year,
}

/// Range partitioning of a report table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionScheme {
    /// Date/timestamp column partitioned on
    pub column: String,
    /// Bucket width
    pub rule: PartitionRule,
}

/// Storage backend of a data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Relational table
    #[default]
    Sql,
    /// Search index
    Es,
    /// Relational primary with a search-index candidate written alongside
    Laboratory,
}

/// Build bookkeeping stamped on a configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    /// Start of the last full rebuild
    #[serde(default)]
    pub initiated: Option<DateTime<Utc>>,
    /// Whether the last full rebuild finished
    #[serde(default)]
    pub finished: bool,
    /// Start of the last in-place build
    #[serde(default)]
    pub initiated_in_place: Option<DateTime<Utc>>,
    /// Whether the last in-place build finished
    #[serde(default)]
    pub finished_in_place: bool,
    /// Whether the table was filled by the asynchronous indicator queue
    #[serde(default)]
    pub rebuilt_asynchronously: bool,
}

/// Versioned data source definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    /// Configuration id
    pub id: String,
    /// Revision; bumps on every save
    #[serde(default = "default_revision")]
    pub revision: String,
    /// Owning domain
    pub domain: String,
    /// Logical table id
    pub table_id: String,
    /// Human readable name
    #[serde(default)]
    pub display_name: Option<String>,
    /// Connection the table lives on
    #[serde(default = "default_engine")]
    pub engine_id: String,
    /// Source document type (e.g. `CommCareCase`)
    #[serde(default = "default_doc_type")]
    pub referenced_doc_type: String,
    /// Turned off by an administrator
    #[serde(default)]
    pub is_deactivated: bool,
    /// Never drop an existing table for this configuration
    #[serde(default)]
    pub disable_destructive_rebuild: bool,
    /// Storage backend
    #[serde(default)]
    pub backend: Backend,
    /// Case types or form xmlns; empty means the whole doc type
    #[serde(default)]
    pub units: Vec<String>,
    /// Indicator columns (the doc id key and load timestamp are implicit)
    #[serde(default)]
    pub columns: Vec<ColumnDef>,
    /// Declared indexes
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    /// Optional range partitioning
    #[serde(default)]
    pub partition: Option<PartitionScheme>,
    /// Build bookkeeping
    #[serde(default)]
    pub build: BuildInfo,
}

fn default_engine() -> String {
    "default".to_string()
}

fn default_revision() -> String {
    "1".to_string()
}

fn default_doc_type() -> String {
    "CommCareCase".to_string()
}

impl DataSourceConfig {
    /// Minimal configuration
    pub fn new(
        id: impl Into<String>,
        domain: impl Into<String>,
        table_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            revision: default_revision(),
            domain: domain.into(),
            table_id: table_id.into(),
            display_name: None,
            engine_id: default_engine(),
            referenced_doc_type: default_doc_type(),
            is_deactivated: false,
            disable_destructive_rebuild: false,
            backend: Backend::Sql,
            units: Vec::new(),
            columns: Vec::new(),
            indexes: Vec::new(),
            partition: None,
            build: BuildInfo::default(),
        }
    }

    /// Set the revision
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    /// Set the engine id
    pub fn with_engine(mut self, engine_id: impl Into<String>) -> Self {
        self.engine_id = engine_id.into();
        self
    }

    /// Add an indicator column
    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Add an index
    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Set iteration units
    pub fn with_units<I, S>(mut self, units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.units = units.into_iter().map(Into::into).collect();
        self
    }

    /// Set the backend
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Set partitioning
    pub fn with_partition(mut self, partition: PartitionScheme) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Protect the existing table from drop-and-recreate
    pub fn with_destructive_rebuild_disabled(mut self) -> Self {
        self.disable_destructive_rebuild = true;
        self
    }

    /// Built-in, unversioned configuration
    pub fn is_static(&self) -> bool {
        self.id.starts_with(STATIC_PREFIX)
    }

    /// Physical table name
    pub fn table_name(&self) -> String {
        get_table_name(&self.domain, &self.table_id)
    }

    /// Revision used in resume keys
    pub fn resume_revision(&self) -> &str {
        if self.is_static() {
            STATIC_REVISION
        } else {
            &self.revision
        }
    }

    /// Units to walk during a build; `None` stands for the whole doc type
    pub fn build_units(&self) -> Vec<Option<String>> {
        if self.units.is_empty() {
            vec![None]
        } else {
            self.units.iter().cloned().map(Some).collect()
        }
    }

    /// Check the definition is usable
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(RebuildError::bad_spec("data source has no id"));
        }
        if self.domain.is_empty() || self.domain.contains('.') {
            return Err(RebuildError::bad_spec(format!(
                "invalid domain {:?} for {}",
                self.domain, self.id
            )));
        }
        if self.table_id.is_empty() {
            return Err(RebuildError::bad_spec(format!("{} has no table id", self.id)));
        }
        let mut seen = std::collections::HashSet::new();
        for column in &self.columns {
            if column.name == DOC_ID_COLUMN || column.name == INSERTED_AT_COLUMN {
                return Err(RebuildError::bad_spec(format!(
                    "column {} is reserved",
                    column.name
                )));
            }
            ucr_rdbc::security::validate_sql_identifier(&column.name)
                .map_err(|e| RebuildError::bad_spec(e.to_string()))?;
            if !seen.insert(column.name.as_str()) {
                return Err(RebuildError::bad_spec(format!(
                    "duplicate column {} in {}",
                    column.name, self.id
                )));
            }
        }
        for index in &self.indexes {
            if index.columns.is_empty() {
                return Err(RebuildError::bad_spec(format!("empty index in {}", self.id)));
            }
        }
        if let Some(partition) = &self.partition {
            let known = self
                .columns
                .iter()
                .any(|c| {
                    c.name == partition.column
                        && matches!(c.datatype, Datatype::Date | Datatype::DateTime)
                });
            if !known {
                return Err(RebuildError::bad_spec(format!(
                    "partition column {} must be a date column",
                    partition.column
                )));
            }
        }
        Ok(())
    }
}

/// Physical name `config_report_{domain}_{table_id}_{hash}` kept within the
/// identifier limit; truncation eats the middle, never the hash.
pub fn get_table_name(domain: &str, table_id: &str) -> String {
    let hash = short_hash(&format!("{}{}", domain, table_id), 8);
    let body = format!("{}_{}", domain, table_id);
    let budget = MAX_IDENTIFIER_LEN - TABLE_PREFIX.len() - 1 - hash.len();

    let mut end = body.len().min(budget);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}_{}", TABLE_PREFIX, &body[..end], hash)
}

/// First hex digit of the table id hash, used to split data sources
/// across workers
pub fn table_hash_digit(table_id: &str) -> char {
    short_hash(table_id, 1).chars().next().unwrap_or('0')
}

fn short_hash(input: &str, len: usize) -> String {
    let digest = hex::encode(Sha256::digest(input.as_bytes()));
    digest[..len].to_string()
}

/// The shape a physical table must have
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    /// Owning domain
    pub domain: String,
    /// Logical table id
    pub table_id: String,
    /// Physical name
    pub table_name: String,
    /// Ordered columns
    pub columns: Vec<ColumnDef>,
    /// Indexes
    pub indexes: Vec<IndexDef>,
    /// Optional range partitioning
    pub partition: Option<PartitionScheme>,
}

impl TableDefinition {
    /// Expected column/key metadata
    pub fn to_table_metadata(&self) -> TableMetadata {
        let mut table = TableMetadata::new(&self.table_name);
        let mut pk_ordinal = 0;
        for (i, column) in self.columns.iter().enumerate() {
            let mut meta = ColumnMetadata::new(&column.name, column.datatype.sql_type())
                .with_ordinal(i as u32 + 1);
            if column.is_primary_key {
                pk_ordinal += 1;
                meta = meta.with_primary_key(pk_ordinal);
            } else if !column.nullable {
                meta = meta.not_null();
            }
            table.columns.push(meta);
        }
        table
    }

    /// Expected secondary indexes
    pub fn index_metadata(&self) -> Vec<IndexMetadata> {
        self.indexes
            .iter()
            .map(|ix| {
                IndexMetadata::new(
                    &self.table_name,
                    ix.resolved_name(&self.table_name),
                    ix.columns.clone(),
                )
            })
            .collect()
    }

    /// Column names in order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Turns a configuration into its table definition
pub trait TableDefinitionProvider: Send + Sync {
    /// Build the definition
    fn definition(&self, config: &DataSourceConfig) -> Result<TableDefinition>;
}

impl<F> TableDefinitionProvider for F
where
    F: Fn(&DataSourceConfig) -> Result<TableDefinition> + Send + Sync,
{
    fn definition(&self, config: &DataSourceConfig) -> Result<TableDefinition> {
        self(config)
    }
}

/// Standard layout: `doc_id` key, the indicator columns, then `inserted_at`
/// with its own index
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDefinitionProvider;

impl TableDefinitionProvider for DefaultDefinitionProvider {
    fn definition(&self, config: &DataSourceConfig) -> Result<TableDefinition> {
        config.validate()?;

        let mut columns = Vec::with_capacity(config.columns.len() + 2);
        columns.push(ColumnDef::new(DOC_ID_COLUMN, Datatype::String).primary_key());
        for column in &config.columns {
            let mut column = column.clone();
            // Partitioned tables need the partition column in the key
            if config.partition.as_ref().is_some_and(|p| p.column == column.name) {
                column = column.primary_key();
            }
            columns.push(column);
        }
        columns.push(ColumnDef::new(INSERTED_AT_COLUMN, Datatype::DateTime).not_null());

        let mut indexes = config.indexes.clone();
        indexes.push(IndexDef::on(&[INSERTED_AT_COLUMN]));

        Ok(TableDefinition {
            domain: config.domain.clone(),
            table_id: config.table_id.clone(),
            table_name: config.table_name(),
            columns,
            indexes,
            partition: config.partition.clone(),
        })
    }
}
