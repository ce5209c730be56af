//! Schema module for db_mirror
//!
//! This module handles schema introspection, comparison and DDL application.

pub mod analyzer;
pub mod diff;
pub mod sync;
pub mod types;

// Re-export key types
pub use analyzer::{Analysis, SchemaAnalyzer};
pub use diff::{AttributeDifference, DiffStatus, SchemaDiff, TypeMismatch};
pub use sync::{ChangeAction, SchemaChange, SchemaSyncMode, SchemaSynchronizer};
pub use types::{ColumnDef, ForeignKeyDef, KeyDef, KeyKind, TableSchema};
