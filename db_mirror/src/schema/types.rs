//! Type definitions for database schema objects

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// Integer display widths, e.g. `int(11)`. MySQL 8 no longer reports them.
static INT_DISPLAY_WIDTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(tinyint|smallint|mediumint|int|bigint)\(\d+\)").expect("valid regex")
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Reduce a declared column type to a signature that is stable across
/// whitespace, casing and cosmetic spelling differences.
pub fn normalize_type(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let collapsed = WHITESPACE.replace_all(&lowered, " ");
    let mut normalized = collapsed
        .replace(" (", "(")
        .replace("( ", "(")
        .replace(" )", ")")
        .replace(", ", ",")
        .replace(" ,", ",");

    normalized = match normalized.as_str() {
        "bool" | "boolean" => "tinyint(1)".to_string(),
        _ => normalized,
    };
    if let Some(rest) = normalized.strip_prefix("integer") {
        normalized = format!("int{}", rest);
    }

    // tinyint(1) is how MySQL spells boolean; keep its width
    if !normalized.starts_with("tinyint(1)") {
        normalized = INT_DISPLAY_WIDTH.replace(&normalized, "$1").into_owned();
    }

    normalized
}

/// Represents a database column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// Declared type exactly as the server reports it, e.g. `varchar(255)`
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    /// 1-based position in the table definition
    pub ordinal: u32,
}

impl ColumnDef {
    /// Create a new non-nullable column with the given name and type
    pub fn new(name: &str, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: false,
            default: None,
            ordinal: 0,
        }
    }

    /// Set whether the column is nullable
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Set a default value for the column
    pub fn default(mut self, default: &str) -> Self {
        self.default = Some(default.to_string());
        self
    }

    pub fn type_signature(&self) -> String {
        normalize_type(&self.data_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyKind {
    Primary,
    Unique,
    Index,
}

/// Represents a primary key, unique key or plain index
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyDef {
    pub kind: KeyKind,
    pub name: String,
    pub columns: Vec<String>,
}

/// Represents a foreign key constraint
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    pub name: String,
    pub columns: Vec<String>,
    pub ref_table: String,
    pub ref_columns: Vec<String>,
}

/// Represents a database table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    /// Columns in declared order
    pub columns: Vec<ColumnDef>,
    pub keys: BTreeSet<KeyDef>,
    pub foreign_keys: BTreeSet<ForeignKeyDef>,
}

impl TableSchema {
    /// Create a new table with the given name
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: Vec::new(),
            keys: BTreeSet::new(),
            foreign_keys: BTreeSet::new(),
        }
    }

    /// Add a column to the table. Column names must be unique.
    pub fn add_column(&mut self, mut column: ColumnDef) -> Result<()> {
        if self.column(&column.name).is_some() {
            return Err(Error::SchemaAnalysis(format!(
                "duplicate column {} in table {}",
                column.name, self.name
            )));
        }
        if column.ordinal == 0 {
            column.ordinal = self.columns.len() as u32 + 1;
        }
        self.columns.push(column);
        Ok(())
    }

    /// Builder-style variant of [`add_column`](Self::add_column) for fixtures
    pub fn with_column(mut self, column: ColumnDef) -> Self {
        // a duplicate is simply ignored here
        let _ = self.add_column(column);
        self
    }

    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.keys.insert(KeyDef {
            kind: KeyKind::Primary,
            name: "PRIMARY".to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn with_foreign_key(mut self, name: &str, columns: &[&str], ref_table: &str, ref_columns: &[&str]) -> Self {
        self.foreign_keys.insert(ForeignKeyDef {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            ref_table: ref_table.to_string(),
            ref_columns: ref_columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Primary key columns in key order; empty when the table has none
    pub fn primary_key(&self) -> Vec<String> {
        self.keys
            .iter()
            .find(|k| k.kind == KeyKind::Primary)
            .map(|k| k.columns.clone())
            .unwrap_or_default()
    }

    pub fn has_primary_key(&self) -> bool {
        !self.primary_key().is_empty()
    }

    /// Positions of `names` within the column list
    pub fn positions(&self, names: &[String]) -> Option<Vec<usize>> {
        names
            .iter()
            .map(|n| self.columns.iter().position(|c| &c.name == n))
            .collect()
    }
}
