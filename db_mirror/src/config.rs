//! Configuration handling for db_mirror

use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::db::retry::RetryPolicy;
use crate::error::{Error, Result};
use crate::filter::TableFilter;

/// Load configuration from a TOML file
pub fn load_from_file(path: &str) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

    let config: Config = toml::from_str(&config_str)
        .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

    Ok(config)
}

/// Represents the complete db_mirror configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub remote: DatabaseConfig,
    pub local: DatabaseConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    /// Reject configurations that cannot produce a meaningful run
    pub fn validate(&self) -> Result<()> {
        for (label, db) in [("remote", &self.remote), ("local", &self.local)] {
            if db.url.trim().is_empty() {
                return Err(Error::FatalConfiguration(format!("{} database url is empty", label)));
            }
        }
        if self.remote.url == self.local.url {
            return Err(Error::FatalConfiguration(
                "remote and local point at the same database".to_string(),
            ));
        }
        self.sync.validate()
    }

    pub fn table_filter(&self) -> TableFilter {
        TableFilter::new(
            self.filters.excluded_tables.iter().cloned(),
            self.filters.excluded_patterns.iter().cloned(),
        )
    }
}

/// Database connection configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: Option<u32>,
    pub timeout_seconds: Option<u64>,
}

/// Tables kept out of the run entirely
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct FilterConfig {
    #[serde(default)]
    pub excluded_tables: Vec<String>,
    /// Case-insensitive substrings of table names
    #[serde(default)]
    pub excluded_patterns: Vec<String>,
}

/// How rows are replicated
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Incremental,
    DropRecreate,
    MultiPass,
}

/// How the processing order is derived
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStrategy {
    #[default]
    Dependency,
    Alphabetical,
    CustomPrefix,
}

/// What incremental mode does with a table lacking a primary key
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NoPrimaryKeyPolicy {
    #[default]
    Skip,
    DropRecreate,
}

/// What non multi-pass modes do with tables in a circular group
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircularPolicy {
    #[default]
    DropRecreate,
    Skip,
}

/// Which rows multi-pass orphan cleanup deletes
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Delete when any foreign key of the row is unresolved
    #[default]
    AnyMissing,
    /// Delete only when every non-null foreign key of the row is unresolved
    AllMissing,
    /// Log and count, never delete
    ReportOnly,
}

/// Synchronization behavior configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub mode: SyncMode,
    pub order: OrderStrategy,
    pub custom_order: Vec<String>,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub validate_only: bool,
    pub dry_run: bool,
    pub apply_schema: bool,
    pub no_primary_key: NoPrimaryKeyPolicy,
    pub circular: CircularPolicy,
    pub fallback_to_drop_recreate: bool,
    pub orphan_policy: OrphanPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Incremental,
            order: OrderStrategy::Dependency,
            custom_order: Vec::new(),
            batch_size: 1000,
            max_retries: 3,
            retry_delay_ms: 500,
            validate_only: false,
            dry_run: false,
            apply_schema: true,
            no_primary_key: NoPrimaryKeyPolicy::Skip,
            circular: CircularPolicy::DropRecreate,
            fallback_to_drop_recreate: true,
            orphan_policy: OrphanPolicy::AnyMissing,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::FatalConfiguration("batch_size must be at least 1".to_string()));
        }
        if self.max_retries == 0 {
            return Err(Error::FatalConfiguration("max_retries must be at least 1".to_string()));
        }
        if self.order == OrderStrategy::CustomPrefix && self.custom_order.is_empty() {
            return Err(Error::FatalConfiguration(
                "order = \"custom_prefix\" needs a non-empty custom_order".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether anything is written to the local database
    pub fn is_read_only(&self) -> bool {
        self.validate_only || self.dry_run
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
    }
}

/// Logging configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub format: String,
    pub stdout: bool,
}
