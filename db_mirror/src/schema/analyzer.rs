//! Database schema analyzer
//!
//! This module reads table metadata from both databases and turns it into one
//! [`SchemaDiff`] per table plus the foreign keys the dependency graph is
//! built from.

use std::collections::{BTreeMap, BTreeSet};

use crate::db::handle::DatabaseHandle;
use crate::db::retry::RetryPolicy;
use crate::error::{Error, Result};
use crate::filter::TableFilter;
use crate::schema::diff::SchemaDiff;
use crate::schema::types::{ForeignKeyDef, TableSchema};
use crate::stats::TableError;

/// Result of analyzing both databases
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    /// One diff per successfully analyzed table, sorted by table name
    pub diffs: Vec<SchemaDiff>,
    pub remote_schemas: BTreeMap<String, TableSchema>,
    pub local_schemas: BTreeMap<String, TableSchema>,
    /// Tables whose metadata could not be read
    pub errors: Vec<TableError>,
}

impl Analysis {
    pub fn diff(&self, table: &str) -> Option<&SchemaDiff> {
        self.diffs.iter().find(|d| d.table == table)
    }

    /// Remote tables that were analyzed without error; the candidates for sync
    pub fn syncable_tables(&self) -> impl Iterator<Item = &str> {
        self.remote_schemas.keys().map(String::as_str)
    }

    /// Every foreign key of every analyzed remote table
    pub fn foreign_keys(&self) -> Vec<(&str, &ForeignKeyDef)> {
        self.remote_schemas
            .values()
            .flat_map(|schema| schema.foreign_keys.iter().map(move |fk| (schema.name.as_str(), fk)))
            .collect()
    }

    pub fn exists_locally(&self, table: &str) -> bool {
        self.local_schemas.contains_key(table)
    }
}

/// Schema analyzer for comparing the remote and local databases
pub struct SchemaAnalyzer<'a> {
    remote: &'a dyn DatabaseHandle,
    local: &'a dyn DatabaseHandle,
    filter: &'a TableFilter,
    retry: RetryPolicy,
}

impl<'a> SchemaAnalyzer<'a> {
    /// Create a new schema analyzer
    pub fn new(
        remote: &'a dyn DatabaseHandle,
        local: &'a dyn DatabaseHandle,
        filter: &'a TableFilter,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            remote,
            local,
            filter,
            retry,
        }
    }

    /// Analyze every non-excluded table present on either side.
    ///
    /// Failing to list tables fails the whole analysis. Failing to read one
    /// table's metadata is recorded in [`Analysis::errors`] and the table is
    /// left out of the diffs.
    pub async fn analyze(&self) -> Result<Analysis> {
        let remote_tables = self.list_tables(self.remote).await?;
        let local_tables = self.list_tables(self.local).await?;

        let working_set: BTreeSet<&String> = remote_tables
            .iter()
            .chain(local_tables.iter())
            .filter(|t| self.filter.is_included(t))
            .collect();

        tracing::info!(
            remote = remote_tables.len(),
            local = local_tables.len(),
            analyzed = working_set.len(),
            "Analyzing schemas"
        );

        let mut analysis = Analysis::default();
        for table in working_set {
            let remote = if remote_tables.contains(table) {
                match self.table_schema(self.remote, table).await {
                    Ok(schema) => Some(schema),
                    Err(e) => {
                        analysis.errors.push(table_error(table, self.remote, e));
                        continue;
                    }
                }
            } else {
                None
            };

            let local = if local_tables.contains(table) {
                match self.table_schema(self.local, table).await {
                    Ok(schema) => Some(schema),
                    Err(e) => {
                        analysis.errors.push(table_error(table, self.local, e));
                        continue;
                    }
                }
            } else {
                None
            };

            let diff = SchemaDiff::compare(table, remote.as_ref(), local.as_ref());
            tracing::debug!(table = %table, status = ?diff.status, "Compared table");
            analysis.diffs.push(diff);

            if let Some(schema) = remote {
                analysis.remote_schemas.insert(table.clone(), schema);
            }
            if let Some(schema) = local {
                analysis.local_schemas.insert(table.clone(), schema);
            }
        }

        Ok(analysis)
    }

    async fn list_tables(&self, handle: &dyn DatabaseHandle) -> Result<BTreeSet<String>> {
        let what = format!("list {} tables", handle.label());
        let tables = self
            .retry
            .run(&what, Some(handle), || handle.list_tables())
            .await
            .map_err(|e| Error::SchemaAnalysis(format!("{}: {}", what, e)))?;
        Ok(tables.into_iter().collect())
    }

    async fn table_schema(&self, handle: &dyn DatabaseHandle, table: &str) -> Result<TableSchema> {
        let what = format!("read {} schema of {}", handle.label(), table);
        self.retry
            .run(&what, Some(handle), || handle.table_schema(table))
            .await
    }
}

fn table_error(table: &str, handle: &dyn DatabaseHandle, error: Error) -> TableError {
    tracing::error!(table = %table, side = handle.label(), error = %error, "Failed to read table metadata");
    TableError {
        table: table.to_string(),
        message: format!("{} metadata: {}", handle.label(), error),
    }
}
