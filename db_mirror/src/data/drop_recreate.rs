//! Destructive replacement strategy

use async_trait::async_trait;

use super::{finish_transaction, SyncContext, TableJob, TableSync, TableSyncStrategy};
use crate::db::handle::Statement;
use crate::db::value::Row;
use crate::error::Result;
use crate::stats::{RowCounts, StrategyKind};

/// Drop the local table, recreate it from the remote DDL and copy every row.
///
/// Works for any table, keyed or not, and leaves the local table an exact
/// copy of the remote one. Local-only rows are lost.
pub struct DropRecreateStrategy;

#[async_trait]
impl TableSyncStrategy for DropRecreateStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DropRecreate
    }

    async fn sync_table(&self, ctx: &SyncContext<'_>, job: &TableJob) -> Result<TableSync> {
        let table = job.table();

        if ctx.dry_run {
            let remote_rows = ctx
                .read("count remote rows", ctx.remote, || ctx.remote.row_count(table))
                .await?;
            let local_rows = if job.exists_locally {
                ctx.read("count local rows", ctx.local, || ctx.local.row_count(table))
                    .await?
            } else {
                0
            };
            return Ok(TableSync {
                rows: RowCounts {
                    inserted: remote_rows,
                    deleted: local_rows,
                    ..RowCounts::default()
                },
                created: true,
                dropped: job.exists_locally,
            });
        }

        ctx.control("disable foreign-key checks", || ctx.local.set_foreign_key_checks(false))
            .await?;
        let result = recreate(ctx, job).await;
        // checks must come back on even when the table failed
        let restored = ctx
            .control("enable foreign-key checks", || ctx.local.set_foreign_key_checks(true))
            .await;

        let sync = result?;
        restored?;
        Ok(sync)
    }
}

/// Replace the local table. Foreign-key checks must already be disabled.
pub(super) async fn recreate(ctx: &SyncContext<'_>, job: &TableJob) -> Result<TableSync> {
    let table = job.table();
    let columns = job.schema.column_names();

    let ddl = ctx
        .read("read create statement", ctx.remote, || ctx.remote.create_statement(table))
        .await?;
    let local_rows = if job.exists_locally {
        ctx.read("count local rows", ctx.local, || ctx.local.row_count(table))
            .await?
    } else {
        0
    };
    let rows = ctx
        .read("fetch remote rows", ctx.remote, || ctx.remote.fetch_rows(table, &columns))
        .await?;

    let mut sync = TableSync::default();
    if job.exists_locally {
        ctx.local
            .execute(&Statement::DropTable {
                table: table.to_string(),
            })
            .await?;
        sync.dropped = true;
        sync.rows.deleted = local_rows;
    }

    ctx.local
        .execute(&Statement::CreateTable {
            schema: job.schema.clone(),
            ddl,
        })
        .await?;
    sync.created = true;
    tracing::debug!(table = %table, rows = rows.len(), "Recreated table, copying rows");

    ctx.control("begin transaction", || ctx.local.begin()).await?;
    let inserted = insert_all(ctx, table, &columns, rows).await;
    sync.rows.inserted = finish_transaction(ctx.local, table, inserted).await?;
    Ok(sync)
}

async fn insert_all(ctx: &SyncContext<'_>, table: &str, columns: &[String], rows: Vec<Row>) -> Result<u64> {
    let per_statement = ctx.rows_per_statement(columns.len());
    let mut inserted = 0;
    let mut rows = rows.into_iter().peekable();
    while rows.peek().is_some() {
        let batch: Vec<Row> = rows.by_ref().take(per_statement).collect();
        inserted += batch.len() as u64;
        ctx.local
            .execute(&Statement::Insert {
                table: table.to_string(),
                columns: columns.to_vec(),
                rows: batch,
            })
            .await?;
    }
    Ok(inserted)
}
