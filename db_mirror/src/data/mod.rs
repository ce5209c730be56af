//! Data synchronizer
//!
//! Replicates row contents table by table in resolved order. Each table is
//! dispatched to a [`TableSyncStrategy`] after a capability check: tables with
//! a usable primary key can be diffed row by row, tables without one can only
//! be replaced wholesale.

mod drop_recreate;
mod incremental;
mod multi_pass;

pub use drop_recreate::DropRecreateStrategy;
pub use incremental::IncrementalStrategy;

use async_trait::async_trait;
use std::future::Future;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{CircularPolicy, NoPrimaryKeyPolicy, SyncConfig, SyncMode};
use crate::db::handle::{DatabaseHandle, Statement};
use crate::db::retry::RetryPolicy;
use crate::db::sql;
use crate::error::{Error, Result};
use crate::schema::types::TableSchema;
use crate::stats::{RowCounts, RunStatistics, StrategyKind, TableOutcome, TableState};

/// Everything a strategy needs to sync one table
pub struct SyncContext<'a> {
    pub remote: &'a dyn DatabaseHandle,
    pub local: &'a dyn DatabaseHandle,
    pub batch_size: usize,
    /// Compute counts without writing
    pub dry_run: bool,
    pub retry: RetryPolicy,
}

impl<'a> SyncContext<'a> {
    /// Run a read against `handle` under the retry policy
    pub async fn read<T, F, Fut>(&self, what: &str, handle: &dyn DatabaseHandle, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry.run(what, Some(handle), op).await
    }

    /// Run a session control statement (`begin`, foreign-key toggle) on the
    /// local handle, reconnecting if the session dropped since the last table
    pub async fn control<F, Fut>(&self, what: &str, op: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.retry.run(what, Some(self.local), op).await
    }

    /// Rows per statement for rows of `width` bound values
    pub fn rows_per_statement(&self, width: usize) -> usize {
        sql::rows_per_statement(self.batch_size, width)
    }
}

/// A table queued for data sync
#[derive(Debug, Clone)]
pub struct TableJob {
    /// Remote definition; rows are read and written with its column list
    pub schema: TableSchema,
    pub exists_locally: bool,
    /// Schema differences that prevent key-by-key copying remain
    pub blocking: bool,
    /// Member of a circular foreign-key group
    pub circular: bool,
}

impl TableJob {
    pub fn table(&self) -> &str {
        &self.schema.name
    }
}

/// What a strategy did to one table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSync {
    pub rows: RowCounts,
    pub created: bool,
    pub dropped: bool,
}

/// One way of bringing a local table in line with the remote one
#[async_trait]
pub trait TableSyncStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn sync_table(&self, ctx: &SyncContext<'_>, job: &TableJob) -> Result<TableSync>;
}

/// Outcome of the capability check for one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TablePlan {
    Incremental,
    DropRecreate,
    Skip(String),
}

pub struct DataSynchronizer<'a> {
    ctx: SyncContext<'a>,
    config: &'a SyncConfig,
}

impl<'a> DataSynchronizer<'a> {
    pub fn new(remote: &'a dyn DatabaseHandle, local: &'a dyn DatabaseHandle, config: &'a SyncConfig) -> Self {
        Self {
            ctx: SyncContext {
                remote,
                local,
                batch_size: config.batch_size.max(1),
                dry_run: config.dry_run,
                retry: config.retry_policy(),
            },
            config,
        }
    }

    /// Decide how a table is synced under the configured mode
    pub fn plan(&self, job: &TableJob) -> TablePlan {
        let mode = self.config.mode;
        if mode == SyncMode::DropRecreate {
            return TablePlan::DropRecreate;
        }

        if job.blocking {
            return if self.config.fallback_to_drop_recreate {
                TablePlan::DropRecreate
            } else {
                TablePlan::Skip("schema mismatch prevents incremental sync".to_string())
            };
        }

        if !job.schema.has_primary_key() {
            return match (mode, self.config.no_primary_key) {
                (SyncMode::MultiPass, _) | (_, NoPrimaryKeyPolicy::DropRecreate) => TablePlan::DropRecreate,
                (_, NoPrimaryKeyPolicy::Skip) => TablePlan::Skip("no primary key".to_string()),
            };
        }

        if job.circular && mode == SyncMode::Incremental {
            return match self.config.circular {
                CircularPolicy::DropRecreate => TablePlan::DropRecreate,
                CircularPolicy::Skip => TablePlan::Skip("member of a circular foreign-key group".to_string()),
            };
        }

        TablePlan::Incremental
    }

    /// Sync every job in order, recording one outcome per table.
    ///
    /// Cancellation is checked between tables only. When it fires the partial
    /// statistics are moved into [`Error::Cancelled`].
    pub async fn run(
        &self,
        jobs: Vec<TableJob>,
        stats: &mut RunStatistics,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tracing::info!(
            tables = jobs.len(),
            mode = ?self.config.mode,
            dry_run = self.ctx.dry_run,
            "Starting data sync"
        );

        if self.config.mode == SyncMode::MultiPass && !self.ctx.dry_run {
            return self.run_multi_pass(jobs, stats, cancel).await;
        }

        for job in jobs {
            if cancel.is_cancelled() {
                return Err(cancelled(stats));
            }
            self.sync_one(&job, stats).await;
        }
        Ok(())
    }

    async fn sync_one(&self, job: &TableJob, stats: &mut RunStatistics) {
        let table = job.table();
        let mut state = TableState::Analyzed;

        let strategy: &dyn TableSyncStrategy = match self.plan(job) {
            TablePlan::Incremental => &IncrementalStrategy,
            TablePlan::DropRecreate => &DropRecreateStrategy,
            TablePlan::Skip(reason) => {
                advance(table, &mut state, TableState::Skipped);
                tracing::info!(table = %table, reason = %reason, "Skipping table");
                stats.record(TableOutcome::skipped(table, reason));
                return;
            }
        };

        advance(table, &mut state, TableState::Syncing);
        let started = Instant::now();
        match strategy.sync_table(&self.ctx, job).await {
            Ok(sync) => {
                advance(table, &mut state, TableState::Done);
                tracing::info!(
                    table = %table,
                    strategy = %strategy.kind(),
                    inserted = sync.rows.inserted,
                    updated = sync.rows.updated,
                    deleted = sync.rows.deleted,
                    rejected = sync.rows.constraint_violations,
                    "Table synced"
                );
                stats.tables_created += usize::from(sync.created);
                stats.tables_dropped += usize::from(sync.dropped);
                stats.record(TableOutcome::done(table, strategy.kind(), sync.rows, started.elapsed()));
            }
            Err(e) => {
                advance(table, &mut state, TableState::Errored);
                tracing::error!(table = %table, strategy = %strategy.kind(), error = %e, "Table sync failed");
                if e.is_transient() {
                    self.fresh_sessions().await;
                }
                stats.record(TableOutcome::errored(table, Some(strategy.kind()), e, started.elapsed()));
            }
        }
    }

    /// Start the next table on new sessions after a connection failure
    async fn fresh_sessions(&self) {
        for handle in [self.ctx.remote, self.ctx.local] {
            if let Err(e) = handle.reconnect().await {
                tracing::warn!(handle = handle.label(), error = %e, "Reconnect failed");
            }
        }
    }
}

fn advance(table: &str, state: &mut TableState, next: TableState) {
    debug_assert!(state.can_transition_to(next), "{:?} -> {:?}", state, next);
    tracing::trace!(table = %table, from = ?state, to = ?next, "Table state");
    *state = next;
}

fn cancelled(stats: &mut RunStatistics) -> Error {
    tracing::warn!(processed = stats.tables_processed, "Cancellation requested, stopping before next table");
    Error::Cancelled(Box::new(std::mem::take(stats)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Insert,
    Update,
    Delete,
}

fn tally(counts: &mut RowCounts, kind: WriteKind, rows: u64) {
    match kind {
        WriteKind::Insert => counts.inserted += rows,
        WriteKind::Update => counts.updated += rows,
        WriteKind::Delete => counts.deleted += rows,
    }
}

fn reject(table: &str, error: &Error, counts: &mut RowCounts) {
    tracing::warn!(table = %table, error = %error, "Row rejected by constraint, skipping");
    counts.constraint_violations += 1;
    counts.skipped += 1;
}

/// Execute a row statement. If the statement is rejected by a constraint it is
/// retried row by row and only the rejected rows are skipped.
async fn write_rows(
    local: &dyn DatabaseHandle,
    statement: Statement,
    kind: WriteKind,
    counts: &mut RowCounts,
) -> Result<()> {
    let table = statement.table().to_string();
    let rows = statement.row_count() as u64;

    match local.execute(&statement).await {
        Ok(_) => {
            tally(counts, kind, rows);
            Ok(())
        }
        Err(e) if e.is_constraint_violation() => {
            if rows <= 1 {
                reject(&table, &e, counts);
                return Ok(());
            }
            tracing::debug!(table = %table, rows, "Batch rejected, retrying row by row");
            for single in statement.split_rows() {
                match local.execute(&single).await {
                    Ok(_) => tally(counts, kind, 1),
                    Err(e) if e.is_constraint_violation() => reject(&table, &e, counts),
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Commit on success, roll back on failure
async fn finish_transaction<T>(local: &dyn DatabaseHandle, table: &str, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            local.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = local.rollback().await {
                tracing::error!(table = %table, error = %rollback_err, "Rollback failed");
            }
            Err(e)
        }
    }
}

/// Create a missing local table from the remote's CREATE TABLE text
async fn create_from_remote(ctx: &SyncContext<'_>, schema: &TableSchema) -> Result<()> {
    let table = schema.name.as_str();
    let ddl = ctx
        .read("read create statement", ctx.remote, || ctx.remote.create_statement(table))
        .await?;
    ctx.local
        .execute(&Statement::CreateTable {
            schema: schema.clone(),
            ddl,
        })
        .await?;
    tracing::info!(table = %table, "Created missing local table");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::value::Row;
    use crate::db::value::RowKey;
    use crate::schema::types::ColumnDef;
    use rstest::rstest;

    /// Handle that must never be touched by the capability check
    struct Unreachable;

    #[async_trait]
    impl DatabaseHandle for Unreachable {
        fn label(&self) -> &str {
            "unreachable"
        }
        async fn ping(&self) -> Result<()> {
            unreachable!()
        }
        async fn list_tables(&self) -> Result<Vec<String>> {
            unreachable!()
        }
        async fn table_schema(&self, _: &str) -> Result<TableSchema> {
            unreachable!()
        }
        async fn create_statement(&self, _: &str) -> Result<String> {
            unreachable!()
        }
        async fn row_count(&self, _: &str) -> Result<u64> {
            unreachable!()
        }
        async fn fetch_rows(&self, _: &str, _: &[String]) -> Result<Vec<Row>> {
            unreachable!()
        }
        async fn fetch_keys(&self, _: &str, _: &[String]) -> Result<Vec<RowKey>> {
            unreachable!()
        }
        async fn fetch_rows_by_keys(&self, _: &str, _: &[String], _: &[String], _: &[RowKey]) -> Result<Vec<Row>> {
            unreachable!()
        }
        async fn execute(&self, _: &Statement) -> Result<u64> {
            unreachable!()
        }
        async fn begin(&self) -> Result<()> {
            unreachable!()
        }
        async fn commit(&self) -> Result<()> {
            unreachable!()
        }
        async fn rollback(&self) -> Result<()> {
            unreachable!()
        }
        async fn set_foreign_key_checks(&self, _: bool) -> Result<()> {
            unreachable!()
        }
    }

    fn job(primary_key: bool, blocking: bool, circular: bool) -> TableJob {
        let mut schema = TableSchema::new("t").with_column(ColumnDef::new("id", "int"));
        if primary_key {
            schema = schema.with_primary_key(&["id"]);
        }
        TableJob {
            schema,
            exists_locally: true,
            blocking,
            circular,
        }
    }

    fn plan(config: &SyncConfig, job: &TableJob) -> TablePlan {
        DataSynchronizer::new(&Unreachable, &Unreachable, config).plan(job)
    }

    #[rstest]
    #[case(true, false, false, TablePlan::Incremental)]
    #[case(false, false, false, TablePlan::Skip("no primary key".into()))]
    #[case(true, true, false, TablePlan::DropRecreate)]
    #[case(true, false, true, TablePlan::DropRecreate)]
    fn test_incremental_capability_check(
        #[case] primary_key: bool,
        #[case] blocking: bool,
        #[case] circular: bool,
        #[case] expected: TablePlan,
    ) {
        let config = SyncConfig::default();
        assert_eq!(plan(&config, &job(primary_key, blocking, circular)), expected);
    }

    #[test]
    fn test_policies_change_the_plan() {
        let config = SyncConfig {
            no_primary_key: NoPrimaryKeyPolicy::DropRecreate,
            circular: CircularPolicy::Skip,
            fallback_to_drop_recreate: false,
            ..SyncConfig::default()
        };
        assert_eq!(plan(&config, &job(false, false, false)), TablePlan::DropRecreate);
        assert!(matches!(plan(&config, &job(true, false, true)), TablePlan::Skip(_)));
        assert!(matches!(plan(&config, &job(true, true, false)), TablePlan::Skip(_)));
    }

    #[test]
    fn test_multi_pass_keeps_circular_tables_incremental() {
        let config = SyncConfig {
            mode: SyncMode::MultiPass,
            ..SyncConfig::default()
        };
        assert_eq!(plan(&config, &job(true, false, true)), TablePlan::Incremental);
        assert_eq!(plan(&config, &job(false, false, false)), TablePlan::DropRecreate);
    }

    #[test]
    fn test_drop_recreate_mode_ignores_capabilities() {
        let config = SyncConfig {
            mode: SyncMode::DropRecreate,
            ..SyncConfig::default()
        };
        assert_eq!(plan(&config, &job(true, false, false)), TablePlan::DropRecreate);
        assert_eq!(plan(&config, &job(false, true, true)), TablePlan::DropRecreate);
    }
}
