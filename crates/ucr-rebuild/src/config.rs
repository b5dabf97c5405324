//! Engine configuration
//!
//! All sections deserialize with defaults, so a config file only needs to
//! name what it changes:
//!
//! ```yaml
//! coordinator:
//!   bootstrap_interval: 1h
//! processor:
//!   name: ucr-main-0
//!   ucr_division: "07"
//! build:
//!   chunk_size: 10000
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::definition::INSERTED_AT_COLUMN;
use crate::error::{RebuildError, Result};

/// Root engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildConfig {
    /// Bootstrap debouncing
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    /// Change processing and worker partitioning
    #[serde(default)]
    pub processor: ProcessorConfig,
    /// Table builds
    #[serde(default)]
    pub build: BuildConfig,
    /// Migration classification
    #[serde(default)]
    pub classifier: ClassifierConfig,
}

impl RebuildConfig {
    /// Replace the coordinator section
    pub fn with_coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Replace the processor section
    pub fn with_processor(mut self, processor: ProcessorConfig) -> Self {
        self.processor = processor;
        self
    }

    /// Replace the build section
    pub fn with_build(mut self, build: BuildConfig) -> Self {
        self.build = build;
        self
    }

    /// Replace the classifier section
    pub fn with_classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.classifier = classifier;
        self
    }

    /// Check all sections
    pub fn validate(&self) -> Result<()> {
        self.coordinator.validate()?;
        self.processor.validate()?;
        self.build.validate()?;
        Ok(())
    }
}

/// How often a worker re-reads configurations and reconciles tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Interval for workers that handle user-defined data sources
    #[serde(default = "default_bootstrap_interval", with = "humantime_serde")]
    pub bootstrap_interval: Duration,
    /// Interval for workers that only handle built-in data sources
    #[serde(default = "default_static_bootstrap_interval", with = "humantime_serde")]
    pub static_bootstrap_interval: Duration,
    /// Slack added to the shared record's age to absorb cache expiry rounding
    #[serde(default = "default_expiry_buffer", with = "humantime_serde")]
    pub expiry_buffer: Duration,
}

fn default_bootstrap_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_static_bootstrap_interval() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_expiry_buffer() -> Duration {
    Duration::from_secs(1)
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bootstrap_interval: default_bootstrap_interval(),
            static_bootstrap_interval: default_static_bootstrap_interval(),
            expiry_buffer: default_expiry_buffer(),
        }
    }
}

impl CoordinatorConfig {
    /// Set the bootstrap interval
    pub fn with_bootstrap_interval(mut self, interval: Duration) -> Self {
        self.bootstrap_interval = interval;
        self
    }

    /// Set the static bootstrap interval
    pub fn with_static_bootstrap_interval(mut self, interval: Duration) -> Self {
        self.static_bootstrap_interval = interval;
        self
    }

    /// Interval for a worker of the given kind
    pub fn interval_for(&self, static_only: bool) -> Duration {
        if static_only {
            self.static_bootstrap_interval
        } else {
            self.bootstrap_interval
        }
    }

    fn validate(&self) -> Result<()> {
        if self.expiry_buffer >= self.bootstrap_interval && !self.bootstrap_interval.is_zero() {
            return Err(RebuildError::config(
                "coordinator.expiry_buffer must be shorter than bootstrap_interval",
            ));
        }
        Ok(())
    }
}

/// Which data sources a worker handles and how it writes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Worker name; part of the coordinator key
    #[serde(default = "default_processor_name")]
    pub name: String,
    /// Handle only built-in data sources
    #[serde(default)]
    pub static_only: bool,
    /// Handle only these table ids
    #[serde(default)]
    pub include_ucrs: Option<Vec<String>>,
    /// Never handle these table ids
    #[serde(default)]
    pub exclude_ucrs: Option<Vec<String>>,
    /// Two hex digits: first and last hash digit this worker owns
    #[serde(default)]
    pub ucr_division: Option<String>,
    /// Saves slower than this are logged
    #[serde(default = "default_slow_save_threshold", with = "humantime_serde")]
    pub slow_save_threshold: Duration,
}

fn default_processor_name() -> String {
    "ucr-main".to_string()
}

fn default_slow_save_threshold() -> Duration {
    Duration::from_millis(500)
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            name: default_processor_name(),
            static_only: false,
            include_ucrs: None,
            exclude_ucrs: None,
            ucr_division: None,
            slow_save_threshold: default_slow_save_threshold(),
        }
    }
}

impl ProcessorConfig {
    /// Set the worker name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Handle only built-in data sources
    pub fn with_static_only(mut self, static_only: bool) -> Self {
        self.static_only = static_only;
        self
    }

    /// Handle only these table ids
    pub fn with_include<I, S>(mut self, table_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_ucrs = Some(table_ids.into_iter().map(Into::into).collect());
        self
    }

    /// Never handle these table ids
    pub fn with_exclude<I, S>(mut self, table_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_ucrs = Some(table_ids.into_iter().map(Into::into).collect());
        self
    }

    /// Own a range of table hash digits
    pub fn with_division(mut self, division: impl Into<String>) -> Self {
        self.ucr_division = Some(division.into());
        self
    }

    /// Parsed division bounds, inclusive
    pub fn division_bounds(&self) -> Result<Option<(char, char)>> {
        let Some(division) = self.ucr_division.as_deref() else {
            return Ok(None);
        };
        let digits: Vec<char> = division.chars().collect();
        match digits.as_slice() {
            [start, end] if start.is_ascii_hexdigit() && end.is_ascii_hexdigit() => {
                let (start, end) = (start.to_ascii_lowercase(), end.to_ascii_lowercase());
                if start > end {
                    return Err(RebuildError::config(format!(
                        "ucr_division {:?} has its start after its end",
                        division
                    )));
                }
                Ok(Some((start, end)))
            }
            _ => Err(RebuildError::config(format!(
                "ucr_division must be two hex digits, got {:?}",
                division
            ))),
        }
    }

    /// Check the worker name and filter settings
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RebuildError::config("processor.name must not be empty"));
        }
        if self.include_ucrs.is_some() && self.ucr_division.is_some() {
            return Err(RebuildError::config(
                "include_ucrs and ucr_division are mutually exclusive",
            ));
        }
        self.division_bounds()?;
        Ok(())
    }
}

/// Table build settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Document ids loaded per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Cap on documents per unit, for trial builds
    #[serde(default)]
    pub limit: Option<usize>,
    /// Rows per insert batch
    #[serde(default = "default_load_batch_size")]
    pub load_batch_size: usize,
    /// Rebuild jobs buffered before enqueue waits
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_chunk_size() -> usize {
    crate::build::DEFAULT_CHUNK_SIZE
}

fn default_load_batch_size() -> usize {
    crate::loader::DEFAULT_BATCH_SIZE
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            limit: None,
            load_batch_size: default_load_batch_size(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl BuildConfig {
    /// Set the chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Cap documents per unit
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RebuildError::config("build.chunk_size must be positive"));
        }
        if self.load_batch_size == 0 {
            return Err(RebuildError::config("build.load_batch_size must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(RebuildError::config("build.queue_capacity must be positive"));
        }
        Ok(())
    }
}

/// Migration classifier settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Index-only changes on these columns are left to operators
    #[serde(default = "default_ignored_index_columns")]
    pub ignored_index_columns: Vec<String>,
}

fn default_ignored_index_columns() -> Vec<String> {
    vec![INSERTED_AT_COLUMN.to_string()]
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            ignored_index_columns: default_ignored_index_columns(),
        }
    }
}
