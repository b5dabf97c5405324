//! Selecting the data sources one worker is responsible for
//!
//! A static-only worker sees static configurations alone. Exclusions apply
//! next. An include list then wins over a hash division; the two are never
//! configured together.

use std::collections::HashSet;

use crate::config::ProcessorConfig;
use crate::definition::{table_hash_digit, DataSourceConfig};
use crate::error::Result;

/// Per-worker configuration filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFilter {
    include: Option<HashSet<String>>,
    exclude: HashSet<String>,
    division: Option<(char, char)>,
    static_only: bool,
}

impl ConfigFilter {
    /// Filter that accepts everything
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter from the processor section
    pub fn from_processor(config: &ProcessorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            include: config
                .include_ucrs
                .as_ref()
                .map(|ids| ids.iter().cloned().collect()),
            exclude: config
                .exclude_ucrs
                .iter()
                .flatten()
                .cloned()
                .collect(),
            division: config.division_bounds()?,
            static_only: config.static_only,
        })
    }

    /// Whether this worker handles `config`
    pub fn accepts(&self, config: &DataSourceConfig) -> bool {
        if self.static_only && !config.is_static() {
            return false;
        }
        if self.exclude.contains(&config.table_id) {
            return false;
        }
        if let Some(include) = &self.include {
            return include.contains(&config.table_id);
        }
        match self.division {
            Some((start, end)) => {
                let digit = table_hash_digit(&config.table_id);
                start <= digit && digit <= end
            }
            None => true,
        }
    }

    /// Keep the accepted configurations
    pub fn apply(&self, configs: Vec<DataSourceConfig>) -> Vec<DataSourceConfig> {
        configs.into_iter().filter(|c| self.accepts(c)).collect()
    }
}
