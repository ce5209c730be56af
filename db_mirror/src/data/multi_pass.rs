//! Three-pass load for schemas with circular foreign keys
//!
//! 1. With foreign-key checks off, load every table. A row whose references
//!    are not present locally yet is deferred instead of written.
//! 2. Once every table is loaded, write the deferred rows whose references are
//!    satisfied by the loaded data or by other deferred rows. This is what
//!    lets mutually referencing rows in a cycle land together. Rows that still
//!    dangle are skipped.
//! 3. With checks back on, find rows that still reference a missing key and
//!    handle them according to the orphan policy.

use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::drop_recreate::recreate;
use super::incremental::{changed_rows, diff_keys, KeyLayout};
use super::{
    cancelled, create_from_remote, finish_transaction, write_rows, DataSynchronizer, SyncContext, TableJob,
    TablePlan, WriteKind,
};
use crate::config::OrphanPolicy;
use crate::db::handle::Statement;
use crate::db::value::{Row, RowKey};
use crate::error::{Error, Result};
use crate::schema::types::{ForeignKeyDef, TableSchema};
use crate::stats::{RowCounts, RunStatistics, StrategyKind, TableOutcome};

/// A row held back in pass 1
struct Deferred {
    kind: WriteKind,
    /// Full remote row, used to re-check references
    row: Row,
    statement: Statement,
}

/// Per-table progress across the passes
struct Progress {
    job: TableJob,
    counts: RowCounts,
    deferred: Vec<Deferred>,
    error: Option<Error>,
    started: Instant,
}

/// Keys known to exist locally, per referenced `(table, columns)`
#[derive(Default)]
struct KnownKeys {
    keys: HashMap<(String, Vec<String>), HashSet<RowKey>>,
}

impl KnownKeys {
    async fn load(&mut self, ctx: &SyncContext<'_>, table: &str, columns: &[String], exists: bool) -> Result<()> {
        let entry = (table.to_string(), columns.to_vec());
        if self.keys.contains_key(&entry) {
            return Ok(());
        }
        let keys = if exists {
            ctx.read("fetch referenced keys", ctx.local, || ctx.local.fetch_keys(table, columns))
                .await?
                .into_iter()
                .collect()
        } else {
            HashSet::new()
        };
        self.keys.insert(entry, keys);
        Ok(())
    }

    fn contains(&self, table: &str, columns: &[String], key: &RowKey) -> bool {
        self.keys
            .get(&(table.to_string(), columns.to_vec()))
            .is_some_and(|keys| keys.contains(key))
    }

    /// Remember the keys a row of `schema` provides to loaded key sets
    fn record(&mut self, schema: &TableSchema, row: &Row) {
        for ((table, columns), keys) in self.keys.iter_mut() {
            if table != &schema.name {
                continue;
            }
            if let Some(positions) = schema.positions(columns) {
                keys.insert(RowKey::project(row, &positions));
            }
        }
    }

    fn forget(&mut self, table: &str) {
        self.keys.retain(|(t, _), _| t != table);
    }
}

type ReferenceCheck<'s> = (Vec<usize>, &'s ForeignKeyDef);

/// Foreign keys of `schema` that point at tables taking part in the run
fn reference_checks<'s>(schema: &'s TableSchema, in_run: &BTreeSet<String>) -> Vec<ReferenceCheck<'s>> {
    schema
        .foreign_keys
        .iter()
        .filter(|fk| in_run.contains(&fk.ref_table))
        .filter_map(|fk| schema.positions(&fk.columns).map(|positions| (positions, fk)))
        .collect()
}

/// A NULL component means the row references nothing through that key
fn resolvable(known: &KnownKeys, checks: &[ReferenceCheck<'_>], row: &Row) -> bool {
    checks.iter().all(|(positions, fk)| {
        let key = RowKey::project(row, positions);
        key.has_null() || known.contains(&fk.ref_table, &fk.ref_columns, &key)
    })
}

impl<'a> DataSynchronizer<'a> {
    pub(super) async fn run_multi_pass(
        &self,
        jobs: Vec<TableJob>,
        stats: &mut RunStatistics,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let in_run: BTreeSet<String> = jobs.iter().map(|j| j.table().to_string()).collect();
        let mut existing: BTreeSet<String> = jobs
            .iter()
            .filter(|j| j.exists_locally)
            .map(|j| j.table().to_string())
            .collect();

        let mut progress: IndexMap<String, Progress> = IndexMap::new();
        let mut known = KnownKeys::default();

        ctx.control("disable foreign-key checks", || ctx.local.set_foreign_key_checks(false))
            .await?;
        tracing::info!(tables = jobs.len(), "Pass 1: loading with foreign-key checks disabled");

        for job in jobs {
            if cancel.is_cancelled() {
                if let Err(e) = ctx
                    .control("enable foreign-key checks", || ctx.local.set_foreign_key_checks(true))
                    .await
                {
                    tracing::error!(error = %e, "Failed to re-enable foreign-key checks");
                }
                record_all(progress, stats);
                return Err(cancelled(stats));
            }

            let table = job.table().to_string();
            let replace = match self.plan(&job) {
                TablePlan::Skip(reason) => {
                    tracing::info!(table = %table, reason = %reason, "Skipping table");
                    stats.record(TableOutcome::skipped(&table, reason));
                    continue;
                }
                TablePlan::DropRecreate => true,
                TablePlan::Incremental => false,
            };

            let mut entry = Progress {
                job,
                counts: RowCounts::default(),
                deferred: Vec::new(),
                error: None,
                started: Instant::now(),
            };

            let loaded = if replace {
                recreate(ctx, &entry.job).await.map(|sync| {
                    stats.tables_created += usize::from(sync.created);
                    stats.tables_dropped += usize::from(sync.dropped);
                    known.forget(&table);
                    sync.rows
                })
            } else {
                let result =
                    load_deferring(ctx, &entry.job, &in_run, &existing, &mut known, &mut entry.deferred).await;
                if result.is_ok() && !entry.job.exists_locally {
                    stats.tables_created += 1;
                }
                result
            };

            match loaded {
                Ok(counts) => {
                    existing.insert(table.clone());
                    tracing::debug!(
                        table = %table,
                        inserted = counts.inserted,
                        deferred = entry.deferred.len(),
                        "Loaded table"
                    );
                    entry.counts = counts;
                }
                Err(e) => {
                    tracing::error!(table = %table, error = %e, "Pass 1 failed for table");
                    // rows recorded while loading were rolled back
                    known.forget(&table);
                    entry.error = Some(e);
                }
            }
            progress.insert(table, entry);
        }

        tracing::info!("Pass 2: writing deferred rows");
        self.write_deferred(&mut progress, &in_run, &existing, &mut known).await;

        ctx.control("enable foreign-key checks", || ctx.local.set_foreign_key_checks(true))
            .await?;

        if cancel.is_cancelled() {
            record_all(progress, stats);
            return Err(cancelled(stats));
        }

        tracing::info!(policy = ?self.config.orphan_policy, "Pass 3: orphan cleanup");
        stats.orphans_deleted += self.clean_orphans(&mut progress, &in_run, &existing).await;

        record_all(progress, stats);
        Ok(())
    }

    async fn write_deferred(
        &self,
        progress: &mut IndexMap<String, Progress>,
        in_run: &BTreeSet<String>,
        existing: &BTreeSet<String>,
        known: &mut KnownKeys,
    ) {
        let ctx = &self.ctx;

        for (table, entry) in progress.iter_mut() {
            if entry.error.is_some() || entry.deferred.is_empty() {
                continue;
            }
            for (_, fk) in reference_checks(&entry.job.schema, in_run) {
                let exists = existing.contains(&fk.ref_table);
                if let Err(e) = known.load(ctx, &fk.ref_table, &fk.ref_columns, exists).await {
                    tracing::error!(table = %table, error = %e, "Pass 2 failed for table");
                    entry.error = Some(e);
                    break;
                }
            }
        }

        // deferred rows can satisfy each other, unless their table failed
        for entry in progress.values().filter(|e| e.error.is_none()) {
            for deferred in &entry.deferred {
                known.record(&entry.job.schema, &deferred.row);
            }
        }

        for (table, entry) in progress.iter_mut() {
            if entry.error.is_some() || entry.deferred.is_empty() {
                continue;
            }
            if let Err(e) = ctx.control("begin transaction", || ctx.local.begin()).await {
                entry.error = Some(e);
                continue;
            }

            let checks = reference_checks(&entry.job.schema, in_run);
            let pending = std::mem::take(&mut entry.deferred);
            let mut counts = RowCounts::default();
            let result: Result<()> = async {
                for deferred in pending {
                    if resolvable(known, &checks, &deferred.row) {
                        write_rows(ctx.local, deferred.statement, deferred.kind, &mut counts).await?;
                    } else {
                        tracing::warn!(table = %table, "Row references a key that exists nowhere, skipping");
                        counts.skipped += 1;
                        counts.constraint_violations += 1;
                    }
                }
                Ok(())
            }
            .await;

            match finish_transaction(ctx.local, table, result).await {
                Ok(()) => entry.counts.add(counts),
                Err(e) => {
                    tracing::error!(table = %table, error = %e, "Pass 2 failed for table");
                    entry.error = Some(e);
                }
            }
        }
    }

    /// Returns the number of orphan rows deleted
    async fn clean_orphans(
        &self,
        progress: &mut IndexMap<String, Progress>,
        in_run: &BTreeSet<String>,
        existing: &BTreeSet<String>,
    ) -> u64 {
        let mut total = 0;
        for (table, entry) in progress.iter_mut() {
            if entry.error.is_some() {
                continue;
            }
            let before = entry.counts.deleted;
            match self.clean_table(&entry.job.schema, in_run, existing, &mut entry.counts).await {
                Ok(()) => total += entry.counts.deleted - before,
                Err(e) => {
                    tracing::error!(table = %table, error = %e, "Pass 3 failed for table");
                    entry.error = Some(e);
                }
            }
        }
        total
    }

    /// Delete (or report) rows of one table whose references point nowhere.
    /// References are checked against the keys actually present locally,
    /// including those of tables that failed earlier in the run.
    async fn clean_table(
        &self,
        schema: &TableSchema,
        in_run: &BTreeSet<String>,
        existing: &BTreeSet<String>,
        counts: &mut RowCounts,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let table = schema.name.as_str();

        let checks = reference_checks(schema, in_run);
        if checks.is_empty() {
            return Ok(());
        }
        if !schema.has_primary_key() {
            tracing::debug!(table = %table, "No primary key, orphan rows cannot be addressed");
            return Ok(());
        }

        let layout = KeyLayout::new(schema)?;
        let mut known = KnownKeys::default();
        for (_, fk) in &checks {
            let exists = existing.contains(&fk.ref_table);
            known.load(ctx, &fk.ref_table, &fk.ref_columns, exists).await?;
        }

        let rows = ctx
            .read("fetch local rows", ctx.local, || ctx.local.fetch_rows(table, &layout.columns))
            .await?;

        let mut orphans = Vec::new();
        for row in &rows {
            let mut referenced = 0;
            let mut unresolved = Vec::new();
            for (positions, fk) in &checks {
                let key = RowKey::project(row, positions);
                if key.has_null() {
                    continue;
                }
                referenced += 1;
                if !known.contains(&fk.ref_table, &fk.ref_columns, &key) {
                    unresolved.push(format!("{} -> {}{}", fk.name, fk.ref_table, key));
                }
            }

            let orphan = match self.config.orphan_policy {
                OrphanPolicy::AnyMissing | OrphanPolicy::ReportOnly => !unresolved.is_empty(),
                OrphanPolicy::AllMissing => !unresolved.is_empty() && unresolved.len() == referenced,
            };
            if !orphan {
                continue;
            }

            let key = layout.key_of(row);
            if self.config.orphan_policy == OrphanPolicy::ReportOnly {
                tracing::warn!(table = %table, key = %key, missing = ?unresolved, "Orphan row left in place");
            } else {
                tracing::warn!(table = %table, key = %key, missing = ?unresolved, "Deleting orphan row");
                orphans.push(key);
            }
        }

        if orphans.is_empty() {
            return Ok(());
        }

        ctx.control("begin transaction", || ctx.local.begin()).await?;
        let mut deleted = RowCounts::default();
        let mut result = Ok(());
        for key in orphans {
            let delete = Statement::Delete {
                table: table.to_string(),
                key_columns: layout.key_columns.clone(),
                keys: vec![key],
            };
            if let Err(e) = write_rows(ctx.local, delete, WriteKind::Delete, &mut deleted).await {
                result = Err(e);
                break;
            }
        }
        finish_transaction(ctx.local, table, result).await?;
        counts.add(deleted);
        Ok(())
    }
}

/// Pass 1 for a keyed table: apply the key diff, deferring rows whose
/// references do not exist locally yet
async fn load_deferring(
    ctx: &SyncContext<'_>,
    job: &TableJob,
    in_run: &BTreeSet<String>,
    existing: &BTreeSet<String>,
    known: &mut KnownKeys,
    deferred: &mut Vec<Deferred>,
) -> Result<RowCounts> {
    let schema = &job.schema;
    let table = schema.name.as_str();
    let layout = KeyLayout::new(schema)?;

    if !job.exists_locally {
        create_from_remote(ctx, schema).await?;
    }

    let checks = reference_checks(schema, in_run);
    for (_, fk) in &checks {
        let exists = existing.contains(&fk.ref_table) || fk.ref_table == table;
        known.load(ctx, &fk.ref_table, &fk.ref_columns, exists).await?;
    }

    let keys = diff_keys(ctx, table, &layout, job.exists_locally).await?;
    let changed = changed_rows(ctx, table, &layout, &keys.common).await?;

    ctx.control("begin transaction", || ctx.local.begin()).await?;
    let mut counts = RowCounts::default();
    let result: Result<()> = async {
        for chunk in keys.to_insert.chunks(ctx.rows_per_statement(layout.columns.len())) {
            let rows = ctx
                .read("fetch rows to insert", ctx.remote, || {
                    ctx.remote
                        .fetch_rows_by_keys(table, &layout.columns, &layout.key_columns, chunk)
                })
                .await?;

            let mut ready = Vec::new();
            for row in rows {
                if resolvable(known, &checks, &row) {
                    known.record(schema, &row);
                    ready.push(row);
                } else {
                    let statement = Statement::Insert {
                        table: table.to_string(),
                        columns: layout.columns.clone(),
                        rows: vec![row.clone()],
                    };
                    deferred.push(Deferred {
                        kind: WriteKind::Insert,
                        row,
                        statement,
                    });
                }
            }
            if !ready.is_empty() {
                let insert = Statement::Insert {
                    table: table.to_string(),
                    columns: layout.columns.clone(),
                    rows: ready,
                };
                write_rows(ctx.local, insert, WriteKind::Insert, &mut counts).await?;
            }
        }

        for row in changed {
            let update = layout.update_for(table, &row);
            if resolvable(known, &checks, &row) {
                known.record(schema, &row);
                write_rows(ctx.local, update, WriteKind::Update, &mut counts).await?;
            } else {
                deferred.push(Deferred {
                    kind: WriteKind::Update,
                    row,
                    statement: update,
                });
            }
        }

        for chunk in keys.to_delete.chunks(ctx.rows_per_statement(layout.key_columns.len())) {
            let delete = Statement::Delete {
                table: table.to_string(),
                key_columns: layout.key_columns.clone(),
                keys: chunk.to_vec(),
            };
            write_rows(ctx.local, delete, WriteKind::Delete, &mut counts).await?;
        }
        Ok(())
    }
    .await;

    finish_transaction(ctx.local, table, result).await?;
    Ok(counts)
}

fn record_all(progress: IndexMap<String, Progress>, stats: &mut RunStatistics) {
    for (table, entry) in progress {
        let elapsed = entry.started.elapsed();
        let outcome = match entry.error {
            Some(e) => TableOutcome::errored(&table, Some(StrategyKind::MultiPass), e, elapsed),
            None => TableOutcome::done(&table, StrategyKind::MultiPass, entry.counts, elapsed),
        };
        stats.record(outcome);
    }
}
