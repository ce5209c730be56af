//! Schema difference calculator
//!
//! This module compares the remote and local definition of one table and
//! classifies the result. A [`SchemaDiff`] is a report: it is produced once per
//! analysis run and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::schema::types::{ColumnDef, ForeignKeyDef, TableSchema};

/// Classification of a table after comparing both sides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiffStatus {
    MissingLocally,
    MissingRemotely,
    Mismatched,
    Matched,
}

/// A column whose normalized type differs between the two sides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeMismatch {
    pub column: String,
    pub remote_type: String,
    pub local_type: String,
}

/// A non-type attribute that differs for a column present on both sides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeDifference {
    Nullability { column: String, remote: bool, local: bool },
    Default { column: String, remote: Option<String>, local: Option<String> },
}

/// Represents the differences found for one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub table: String,
    pub status: DiffStatus,
    /// Remote columns absent locally, in remote declared order
    pub missing_columns: Vec<ColumnDef>,
    /// Local columns absent remotely
    pub extra_columns: Vec<String>,
    pub type_mismatches: Vec<TypeMismatch>,
    pub attribute_differences: Vec<AttributeDifference>,
    pub primary_key_differs: bool,
    pub foreign_keys_differ: bool,
}

impl SchemaDiff {
    /// Compare the two sides of one table. At least one side must be present.
    pub fn compare(table: &str, remote: Option<&TableSchema>, local: Option<&TableSchema>) -> Self {
        let mut diff = Self {
            table: table.to_string(),
            status: DiffStatus::Matched,
            missing_columns: Vec::new(),
            extra_columns: Vec::new(),
            type_mismatches: Vec::new(),
            attribute_differences: Vec::new(),
            primary_key_differs: false,
            foreign_keys_differ: false,
        };

        let (remote, local) = match (remote, local) {
            (Some(remote), Some(local)) => (remote, local),
            (Some(_), None) => {
                diff.status = DiffStatus::MissingLocally;
                return diff;
            }
            (None, _) => {
                diff.status = DiffStatus::MissingRemotely;
                return diff;
            }
        };

        // Map columns by name for easier comparison
        let local_columns: HashMap<&str, &ColumnDef> =
            local.columns.iter().map(|c| (c.name.as_str(), c)).collect();

        for remote_col in &remote.columns {
            let Some(local_col) = local_columns.get(remote_col.name.as_str()) else {
                diff.missing_columns.push(remote_col.clone());
                continue;
            };

            if remote_col.type_signature() != local_col.type_signature() {
                diff.type_mismatches.push(TypeMismatch {
                    column: remote_col.name.clone(),
                    remote_type: remote_col.data_type.clone(),
                    local_type: local_col.data_type.clone(),
                });
            }

            if remote_col.nullable != local_col.nullable {
                diff.attribute_differences.push(AttributeDifference::Nullability {
                    column: remote_col.name.clone(),
                    remote: remote_col.nullable,
                    local: local_col.nullable,
                });
            }

            if remote_col.default != local_col.default {
                diff.attribute_differences.push(AttributeDifference::Default {
                    column: remote_col.name.clone(),
                    remote: remote_col.default.clone(),
                    local: local_col.default.clone(),
                });
            }
        }

        diff.extra_columns = local
            .columns
            .iter()
            .filter(|c| remote.column(&c.name).is_none())
            .map(|c| c.name.clone())
            .collect();

        // Key column order is not significant
        let remote_pk: BTreeSet<String> = remote.primary_key().into_iter().collect();
        let local_pk: BTreeSet<String> = local.primary_key().into_iter().collect();
        diff.primary_key_differs = remote_pk != local_pk;

        // Constraint names are generated differently on each server; compare shapes
        diff.foreign_keys_differ = fk_shapes(remote) != fk_shapes(local);

        if diff.has_discrepancies() {
            diff.status = DiffStatus::Mismatched;
        }

        diff
    }

    fn has_discrepancies(&self) -> bool {
        !self.missing_columns.is_empty()
            || !self.extra_columns.is_empty()
            || !self.type_mismatches.is_empty()
            || !self.attribute_differences.is_empty()
            || self.primary_key_differs
            || self.foreign_keys_differ
    }

    /// Whether rows cannot be copied key-by-key until the schema is fixed
    pub fn is_blocking(&self) -> bool {
        self.status == DiffStatus::MissingLocally
            || !self.missing_columns.is_empty()
            || !self.type_mismatches.is_empty()
            || self.primary_key_differs
    }

    /// Whether the diff only needs columns added to match
    pub fn only_missing_columns(&self) -> bool {
        self.status == DiffStatus::Mismatched
            && !self.missing_columns.is_empty()
            && self.type_mismatches.is_empty()
            && !self.primary_key_differs
    }

    pub fn is_matched(&self) -> bool {
        self.status == DiffStatus::Matched
    }
}

fn fk_shapes(table: &TableSchema) -> BTreeSet<(Vec<String>, String, Vec<String>)> {
    table
        .foreign_keys
        .iter()
        .map(|fk: &ForeignKeyDef| (fk.columns.clone(), fk.ref_table.clone(), fk.ref_columns.clone()))
        .collect()
}
