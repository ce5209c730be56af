//! The synchronization run
//!
//! [`MirrorSync::run`] drives one bounded batch job: analyze both schemas,
//! resolve a processing order, close schema gaps, then replicate rows.

use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

use crate::config::{SyncConfig, SyncMode};
use crate::data::{DataSynchronizer, TableJob};
use crate::db::handle::DatabaseHandle;
use crate::error::{Error, Result};
use crate::filter::TableFilter;
use crate::graph::{DependencyGraph, DependencyResolver, SyncUnit};
use crate::schema::analyzer::{Analysis, SchemaAnalyzer};
use crate::schema::diff::DiffStatus;
use crate::schema::sync::{SchemaSyncMode, SchemaSyncResult, SchemaSynchronizer};
use crate::stats::{RunStatistics, SyncReport, TableOutcome};

/// Replicates a remote database into a local one
pub struct MirrorSync {
    config: SyncConfig,
    filter: TableFilter,
}

impl MirrorSync {
    pub fn new(config: SyncConfig, filter: TableFilter) -> Self {
        Self { config, filter }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run one synchronization.
    ///
    /// Per-table failures end up in the report. Only an unusable
    /// configuration, unreachable handles or cancellation fail the call.
    pub async fn run(
        &self,
        remote: &dyn DatabaseHandle,
        local: &dyn DatabaseHandle,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        self.config.validate()?;
        let retry = self.config.retry_policy();

        for handle in [remote, local] {
            retry
                .run("ping", Some(handle), || handle.ping())
                .await
                .map_err(|e| {
                    Error::FatalConfiguration(format!("{} database is unreachable: {}", handle.label(), e))
                })?;
        }

        let mut stats = RunStatistics::new(self.config.dry_run);
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(Box::new(stats)));
        }

        let analysis = SchemaAnalyzer::new(remote, local, &self.filter, retry.clone())
            .analyze()
            .await?;
        for error in &analysis.errors {
            stats.record(TableOutcome::errored(&error.table, None, &error.message, Default::default()));
        }

        let graph = DependencyGraph::build(
            analysis.syncable_tables(),
            analysis.foreign_keys(),
            &self.filter,
        );
        let order = DependencyResolver::new(&graph).order(self.config.order, &self.config.custom_order);
        let circular_groups = order.iter().filter(|u| u.is_circular()).count();
        tracing::info!(tables = graph.len(), circular_groups, "Resolved processing order");

        let schema_mode = if self.config.validate_only {
            SchemaSyncMode::ValidateOnly
        } else if self.config.dry_run || !self.config.apply_schema {
            SchemaSyncMode::DryRun
        } else {
            SchemaSyncMode::Apply
        };
        let schema_sync = SchemaSynchronizer::new(remote, local, schema_mode, retry.clone())
            .sync(&analysis.diffs, &analysis.remote_schemas)
            .await;
        stats.tables_created += schema_sync.tables_created;
        stats.columns_added += schema_sync.columns_added;
        for (table, message) in &schema_sync.errors {
            stats.record(TableOutcome::errored(table, None, message, Default::default()));
        }

        if self.config.validate_only {
            tracing::info!("Validate-only run, no data synchronized");
        } else {
            let jobs = self.jobs(&order, &analysis, &schema_sync);
            let data = DataSynchronizer::new(remote, local, &self.config);
            data.run(jobs, &mut stats, cancel).await?;
        }

        let recommendations = self.recommendations(&analysis, &order);
        tracing::info!(
            processed = stats.tables_processed,
            synced = stats.tables_synced,
            skipped = stats.tables_skipped,
            errored = stats.tables_errored,
            "Synchronization finished"
        );

        Ok(SyncReport {
            diffs: analysis.diffs,
            analysis_errors: analysis.errors,
            order,
            dependency_chains: graph.chains(),
            schema_changes: schema_sync.changes,
            recommendations,
            statistics: stats,
        })
    }

    /// Data jobs in resolved order, leaving out tables that already failed
    fn jobs(&self, order: &[SyncUnit], analysis: &Analysis, schema_sync: &SchemaSyncResult) -> Vec<TableJob> {
        let mut jobs = Vec::new();
        for unit in order {
            for table in unit.tables() {
                if schema_sync.errors.contains_key(table) {
                    continue;
                }
                let (Some(schema), Some(diff)) = (analysis.remote_schemas.get(table), analysis.diff(table)) else {
                    continue;
                };

                let resolved = schema_sync.resolved.contains(table);
                let missing = diff.status == DiffStatus::MissingLocally;
                jobs.push(TableJob {
                    schema: schema.clone(),
                    exists_locally: !missing || resolved,
                    blocking: !missing && diff.is_blocking() && !resolved,
                    circular: unit.is_circular(),
                });
            }
        }
        jobs
    }

    fn recommendations(&self, analysis: &Analysis, order: &[SyncUnit]) -> Vec<String> {
        let mut recommendations = Vec::new();

        let missing: Vec<&str> = analysis
            .diffs
            .iter()
            .filter(|d| d.status == DiffStatus::MissingLocally)
            .map(|d| d.table.as_str())
            .collect();
        if !missing.is_empty() {
            recommendations.push(format!(
                "Create {} missing local table(s): {}",
                missing.len(),
                missing.join(", ")
            ));
        }

        let with_missing_columns: Vec<&str> = analysis
            .diffs
            .iter()
            .filter(|d| !d.missing_columns.is_empty())
            .map(|d| d.table.as_str())
            .collect();
        if !with_missing_columns.is_empty() {
            recommendations.push(format!(
                "Add missing columns to: {}",
                with_missing_columns.join(", ")
            ));
        }

        let type_mismatches: BTreeSet<&str> = analysis
            .diffs
            .iter()
            .filter(|d| !d.type_mismatches.is_empty())
            .map(|d| d.table.as_str())
            .collect();
        if !type_mismatches.is_empty() {
            recommendations.push(format!(
                "Review column type mismatches manually in: {}",
                type_mismatches.into_iter().collect::<Vec<_>>().join(", ")
            ));
        }

        let remote_only_locally: Vec<&str> = analysis
            .diffs
            .iter()
            .filter(|d| d.status == DiffStatus::MissingRemotely)
            .map(|d| d.table.as_str())
            .collect();
        if !remote_only_locally.is_empty() {
            recommendations.push(format!(
                "Tables only present locally are left untouched: {}",
                remote_only_locally.join(", ")
            ));
        }

        let groups: Vec<String> = order
            .iter()
            .filter(|u| u.is_circular())
            .map(|u| format!("[{}]", u.tables().join(", ")))
            .collect();
        if !groups.is_empty() && self.config.mode != SyncMode::MultiPass {
            recommendations.push(format!(
                "Circular foreign keys between {}; consider mode = \"multi_pass\"",
                groups.join(", ")
            ));
        }

        if !analysis.errors.is_empty() {
            recommendations.push(format!(
                "{} table(s) could not be analyzed; check permissions and connectivity",
                analysis.errors.len()
            ));
        }

        recommendations
    }
}
