//! Schema synchronizer
//!
//! Closes the structural gaps found by the analyzer: missing tables are
//! created from the remote's own DDL and missing columns are added. Type
//! mismatches are only reported.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::db::handle::{DatabaseHandle, Statement};
use crate::db::retry::RetryPolicy;
use crate::db::sql;
use crate::error::Result;
use crate::schema::diff::{DiffStatus, SchemaDiff};
use crate::schema::types::TableSchema;

/// Whether DDL is executed or only described
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaSyncMode {
    ValidateOnly,
    DryRun,
    Apply,
}

impl SchemaSyncMode {
    pub fn applies(self) -> bool {
        self == SchemaSyncMode::Apply
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChangeAction {
    CreateTable,
    AddColumn {
        column: String,
    },
    /// Never applied automatically
    TypeMismatch {
        column: String,
        remote_type: String,
        local_type: String,
    },
}

/// One intended or applied schema change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChange {
    pub table: String,
    #[serde(flatten)]
    pub action: ChangeAction,
    /// SQL that was or would be run
    pub sql: Option<String>,
    pub applied: bool,
    pub error: Option<String>,
}

impl SchemaChange {
    fn planned(table: &str, action: ChangeAction, sql: Option<String>) -> Self {
        Self {
            table: table.to_string(),
            action,
            sql,
            applied: false,
            error: None,
        }
    }
}

/// What a schema sync pass did
#[derive(Debug, Default)]
pub struct SchemaSyncResult {
    pub changes: Vec<SchemaChange>,
    /// Tables whose DDL failed, with the error
    pub errors: BTreeMap<String, String>,
    /// Tables whose blocking differences were fully closed
    pub resolved: BTreeSet<String>,
    pub tables_created: usize,
    pub columns_added: usize,
}

pub struct SchemaSynchronizer<'a> {
    remote: &'a dyn DatabaseHandle,
    local: &'a dyn DatabaseHandle,
    mode: SchemaSyncMode,
    retry: RetryPolicy,
}

impl<'a> SchemaSynchronizer<'a> {
    pub fn new(
        remote: &'a dyn DatabaseHandle,
        local: &'a dyn DatabaseHandle,
        mode: SchemaSyncMode,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            remote,
            local,
            mode,
            retry,
        }
    }

    /// Process every diff. A failing table is recorded in
    /// [`SchemaSyncResult::errors`] and the remaining tables still run.
    pub async fn sync(
        &self,
        diffs: &[SchemaDiff],
        remote_schemas: &BTreeMap<String, TableSchema>,
    ) -> SchemaSyncResult {
        let mut result = SchemaSyncResult::default();

        for diff in diffs {
            let outcome = match diff.status {
                DiffStatus::MissingLocally => match remote_schemas.get(&diff.table) {
                    Some(schema) => self.create_table(schema, &mut result).await,
                    None => continue,
                },
                DiffStatus::Mismatched => self.close_gaps(diff, &mut result).await,
                DiffStatus::MissingRemotely => {
                    tracing::info!(table = %diff.table, "Table exists only locally, leaving it in place");
                    continue;
                }
                DiffStatus::Matched => continue,
            };

            if let Err(e) = outcome {
                tracing::error!(table = %diff.table, error = %e, "Schema sync failed for table");
                result.errors.insert(diff.table.clone(), e.to_string());
            }
        }

        result
    }

    async fn create_table(&self, schema: &TableSchema, result: &mut SchemaSyncResult) -> Result<()> {
        let table = schema.name.as_str();
        let what = format!("read create statement of {}", table);
        let ddl = self
            .retry
            .run(&what, Some(self.remote), || self.remote.create_statement(table))
            .await;

        let ddl = match ddl {
            Ok(ddl) => ddl,
            Err(e) => {
                let mut change = SchemaChange::planned(table, ChangeAction::CreateTable, None);
                change.error = Some(e.to_string());
                result.changes.push(change);
                return Err(e);
            }
        };

        let mut change = SchemaChange::planned(table, ChangeAction::CreateTable, Some(ddl.clone()));
        if !self.mode.applies() {
            tracing::info!(table = %table, "Would create table");
            result.changes.push(change);
            return Ok(());
        }

        let statement = Statement::CreateTable {
            schema: schema.clone(),
            ddl,
        };
        match self.local.execute(&statement).await {
            Ok(_) => {
                tracing::info!(table = %table, "Created table");
                change.applied = true;
                result.changes.push(change);
                result.tables_created += 1;
                result.resolved.insert(table.to_string());
                Ok(())
            }
            Err(e) => {
                change.error = Some(e.to_string());
                result.changes.push(change);
                Err(e)
            }
        }
    }

    async fn close_gaps(&self, diff: &SchemaDiff, result: &mut SchemaSyncResult) -> Result<()> {
        let table = diff.table.as_str();

        for mismatch in &diff.type_mismatches {
            tracing::warn!(
                table = %table,
                column = %mismatch.column,
                remote_type = %mismatch.remote_type,
                local_type = %mismatch.local_type,
                "Column type differs, not altering"
            );
            result.changes.push(SchemaChange::planned(
                table,
                ChangeAction::TypeMismatch {
                    column: mismatch.column.clone(),
                    remote_type: mismatch.remote_type.clone(),
                    local_type: mismatch.local_type.clone(),
                },
                None,
            ));
        }

        if diff.missing_columns.is_empty() {
            return Ok(());
        }

        // Only a table that differs by missing columns alone gets them added
        let apply = self.mode.applies() && diff.only_missing_columns();
        for column in &diff.missing_columns {
            let statement = Statement::AddColumn {
                table: table.to_string(),
                column: column.clone(),
            };
            let (ddl, _) = sql::render(&statement);
            let mut change = SchemaChange::planned(
                table,
                ChangeAction::AddColumn {
                    column: column.name.clone(),
                },
                Some(ddl),
            );

            if !apply {
                result.changes.push(change);
                continue;
            }

            match self.local.execute(&statement).await {
                Ok(_) => {
                    tracing::info!(table = %table, column = %column.name, "Added column");
                    change.applied = true;
                    result.changes.push(change);
                    result.columns_added += 1;
                }
                Err(e) => {
                    change.error = Some(e.to_string());
                    result.changes.push(change);
                    return Err(e);
                }
            }
        }

        if apply {
            result.resolved.insert(table.to_string());
        }
        Ok(())
    }
}
