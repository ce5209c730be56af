//! db_mirror: one-way replication of a remote MySQL database into a local one
//!
//! A run compares the table definitions on both sides, orders tables by their
//! foreign keys, closes schema gaps and then copies rows with one of three
//! strategies (incremental diff, drop/recreate, multi-pass). Failures are
//! contained per table and reported in the returned [`SyncReport`].
//!
//! The engine talks to databases only through [`DatabaseHandle`];
//! [`DatabaseConnection`] is the MySQL implementation.

pub mod config;
pub mod data;
pub mod db;
pub mod engine;
pub mod error;
pub mod filter;
pub mod graph;
pub mod schema;
pub mod stats;
pub mod utils;

// Re-export main types for easier access
pub use config::{Config, SyncConfig, SyncMode};
pub use db::connection::DatabaseConnection;
pub use db::handle::{DatabaseHandle, Statement};
pub use engine::MirrorSync;
pub use error::{Error, Result};
pub use filter::TableFilter;
pub use graph::{DependencyGraph, DependencyResolver, SyncUnit};
pub use schema::analyzer::SchemaAnalyzer;
pub use schema::diff::SchemaDiff;
pub use stats::{RunStatistics, SyncReport, TableOutcome, TableState};

use tokio_util::sync::CancellationToken;

/// Connect to both databases named in the configuration file and run one
/// synchronization
pub async fn run_from_file(config_path: &str, cancel: &CancellationToken) -> Result<SyncReport> {
    let config = config::load_from_file(config_path)?;
    run_with_config(config, cancel).await
}

/// Connect, run, and close both connections
pub async fn run_with_config(config: Config, cancel: &CancellationToken) -> Result<SyncReport> {
    config.validate()?;

    let remote = DatabaseConnection::connect("remote", &config.remote).await?;
    let local = match DatabaseConnection::connect("local", &config.local).await {
        Ok(local) => local,
        Err(e) => {
            remote.close().await;
            return Err(e);
        }
    };

    let engine = MirrorSync::new(config.sync.clone(), config.table_filter());
    let report = engine.run(&remote, &local, cancel).await;

    remote.close().await;
    local.close().await;
    report
}
