//! Key-set diff strategy for tables with a primary key

use async_trait::async_trait;
use indexmap::IndexSet;
use std::collections::HashMap;

use super::{create_from_remote, finish_transaction, write_rows, SyncContext, TableJob, TableSync, TableSyncStrategy, WriteKind};
use crate::db::handle::Statement;
use crate::db::value::{Row, RowKey, Value};
use crate::error::{Error, Result};
use crate::schema::types::TableSchema;
use crate::stats::{RowCounts, StrategyKind};

/// Column layout of a keyed table, as rows are fetched
#[derive(Debug, Clone)]
pub(super) struct KeyLayout {
    pub columns: Vec<String>,
    pub key_columns: Vec<String>,
    key_positions: Vec<usize>,
    pub value_columns: Vec<String>,
    value_positions: Vec<usize>,
}

impl KeyLayout {
    pub fn new(schema: &TableSchema) -> Result<Self> {
        let key_columns = schema.primary_key();
        if key_columns.is_empty() {
            return Err(Error::Database(format!("{} has no primary key", schema.name)));
        }
        let key_positions = schema.positions(&key_columns).ok_or_else(|| {
            Error::SchemaAnalysis(format!("primary key of {} names an unknown column", schema.name))
        })?;

        let mut value_columns = Vec::new();
        let mut value_positions = Vec::new();
        for (i, column) in schema.columns.iter().enumerate() {
            if !key_positions.contains(&i) {
                value_columns.push(column.name.clone());
                value_positions.push(i);
            }
        }

        Ok(Self {
            columns: schema.column_names(),
            key_columns,
            key_positions,
            value_columns,
            value_positions,
        })
    }

    pub fn key_of(&self, row: &[Value]) -> RowKey {
        RowKey::project(row, &self.key_positions)
    }

    pub fn update_for(&self, table: &str, row: &Row) -> Statement {
        Statement::Update {
            table: table.to_string(),
            columns: self.value_columns.clone(),
            values: self.value_positions.iter().map(|&i| row[i].clone()).collect(),
            key_columns: self.key_columns.clone(),
            key: self.key_of(row),
        }
    }
}

/// Primary keys partitioned by where they exist
#[derive(Debug, Default)]
pub(super) struct KeyDiff {
    pub to_insert: Vec<RowKey>,
    pub to_delete: Vec<RowKey>,
    pub common: Vec<RowKey>,
}

impl KeyDiff {
    pub fn compute(remote: IndexSet<RowKey>, local: IndexSet<RowKey>) -> Self {
        let mut diff = KeyDiff::default();
        for key in &remote {
            if local.contains(key) {
                diff.common.push(key.clone());
            } else {
                diff.to_insert.push(key.clone());
            }
        }
        diff.to_delete = local.into_iter().filter(|k| !remote.contains(k)).collect();
        diff
    }
}

pub(super) async fn diff_keys(ctx: &SyncContext<'_>, table: &str, layout: &KeyLayout, exists_locally: bool) -> Result<KeyDiff> {
    let key_columns = layout.key_columns.as_slice();
    let remote: IndexSet<RowKey> = ctx
        .read("fetch remote keys", ctx.remote, || ctx.remote.fetch_keys(table, key_columns))
        .await?
        .into_iter()
        .collect();

    let local: IndexSet<RowKey> = if exists_locally {
        ctx.read("fetch local keys", ctx.local, || ctx.local.fetch_keys(table, key_columns))
            .await?
            .into_iter()
            .collect()
    } else {
        IndexSet::new()
    };

    Ok(KeyDiff::compute(remote, local))
}

/// Remote rows among `common` whose local copy differs in any column
pub(super) async fn changed_rows(ctx: &SyncContext<'_>, table: &str, layout: &KeyLayout, common: &[RowKey]) -> Result<Vec<Row>> {
    let mut changed = Vec::new();
    if layout.value_columns.is_empty() {
        return Ok(changed);
    }

    for chunk in common.chunks(ctx.rows_per_statement(layout.key_columns.len())) {
        let remote_rows = ctx
            .read("fetch remote rows", ctx.remote, || {
                ctx.remote.fetch_rows_by_keys(table, &layout.columns, &layout.key_columns, chunk)
            })
            .await?;
        let local_rows = ctx
            .read("fetch local rows", ctx.local, || {
                ctx.local.fetch_rows_by_keys(table, &layout.columns, &layout.key_columns, chunk)
            })
            .await?;

        let local_by_key: HashMap<RowKey, Row> = local_rows
            .into_iter()
            .map(|row| (layout.key_of(&row), row))
            .collect();

        for row in remote_rows {
            if let Some(local) = local_by_key.get(&layout.key_of(&row)) {
                if local != &row {
                    changed.push(row);
                }
            }
        }
    }

    Ok(changed)
}

/// Diff by primary key and apply only the differences, in one transaction
pub struct IncrementalStrategy;

#[async_trait]
impl TableSyncStrategy for IncrementalStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Incremental
    }

    async fn sync_table(&self, ctx: &SyncContext<'_>, job: &TableJob) -> Result<TableSync> {
        let table = job.table();
        let layout = KeyLayout::new(&job.schema)?;
        let mut sync = TableSync::default();

        if !job.exists_locally && !ctx.dry_run {
            create_from_remote(ctx, &job.schema).await?;
            sync.created = true;
        }

        let keys = diff_keys(ctx, table, &layout, job.exists_locally).await?;
        let changed = changed_rows(ctx, table, &layout, &keys.common).await?;
        let pending = keys.to_insert.len() + changed.len() + keys.to_delete.len();

        tracing::debug!(
            table = %table,
            to_insert = keys.to_insert.len(),
            to_update = changed.len(),
            to_delete = keys.to_delete.len(),
            "Computed row diff"
        );

        if ctx.dry_run {
            sync.rows = RowCounts {
                inserted: keys.to_insert.len() as u64,
                updated: changed.len() as u64,
                deleted: keys.to_delete.len() as u64,
                ..RowCounts::default()
            };
            return Ok(sync);
        }
        if pending == 0 {
            return Ok(sync);
        }

        ctx.control("begin transaction", || ctx.local.begin()).await?;
        let applied = match apply(ctx, table, &layout, &keys, changed).await {
            Ok(rows) if rows.constraint_violations as usize == pending => Err(Error::ConstraintViolation {
                table: table.to_string(),
                message: format!("all {} pending row operations were rejected", pending),
            }),
            other => other,
        };
        sync.rows = finish_transaction(ctx.local, table, applied).await?;
        Ok(sync)
    }
}

async fn apply(
    ctx: &SyncContext<'_>,
    table: &str,
    layout: &KeyLayout,
    keys: &KeyDiff,
    changed: Vec<Row>,
) -> Result<RowCounts> {
    let mut counts = RowCounts::default();

    for chunk in keys.to_insert.chunks(ctx.rows_per_statement(layout.columns.len())) {
        let rows = ctx
            .read("fetch rows to insert", ctx.remote, || {
                ctx.remote.fetch_rows_by_keys(table, &layout.columns, &layout.key_columns, chunk)
            })
            .await?;
        if rows.is_empty() {
            continue;
        }
        let insert = Statement::Insert {
            table: table.to_string(),
            columns: layout.columns.clone(),
            rows,
        };
        write_rows(ctx.local, insert, WriteKind::Insert, &mut counts).await?;
    }

    for row in &changed {
        write_rows(ctx.local, layout.update_for(table, row), WriteKind::Update, &mut counts).await?;
    }

    for chunk in keys.to_delete.chunks(ctx.rows_per_statement(layout.key_columns.len())) {
        let delete = Statement::Delete {
            table: table.to_string(),
            key_columns: layout.key_columns.clone(),
            keys: chunk.to_vec(),
        };
        write_rows(ctx.local, delete, WriteKind::Delete, &mut counts).await?;
    }

    Ok(counts)
}
