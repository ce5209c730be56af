//! The database handle interface
//!
//! The engine never opens connections itself: it is handed two already
//! connected handles and talks to them only through [`DatabaseHandle`].

use async_trait::async_trait;

use crate::db::value::{Row, RowKey};
use crate::error::Result;
use crate::schema::types::{ColumnDef, TableSchema};

/// A DDL or DML statement, rendered to SQL by the handle that executes it
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Create a table. `ddl` is the remote's own CREATE TABLE text.
    CreateTable { schema: TableSchema, ddl: String },
    DropTable { table: String },
    AddColumn { table: String, column: ColumnDef },
    Insert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Row>,
    },
    /// Overwrite `columns` with `values` on the row identified by `key`
    Update {
        table: String,
        columns: Vec<String>,
        values: Row,
        key_columns: Vec<String>,
        key: RowKey,
    },
    Delete {
        table: String,
        key_columns: Vec<String>,
        keys: Vec<RowKey>,
    },
}

impl Statement {
    pub fn table(&self) -> &str {
        match self {
            Statement::CreateTable { schema, .. } => &schema.name,
            Statement::DropTable { table }
            | Statement::AddColumn { table, .. }
            | Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => table,
        }
    }

    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            Statement::CreateTable { .. } | Statement::DropTable { .. } | Statement::AddColumn { .. }
        )
    }

    /// Number of rows the statement targets
    pub fn row_count(&self) -> usize {
        match self {
            Statement::Insert { rows, .. } => rows.len(),
            Statement::Delete { keys, .. } => keys.len(),
            Statement::Update { .. } => 1,
            _ => 0,
        }
    }

    /// Split a multi-row statement into single-row statements
    pub fn split_rows(self) -> Vec<Statement> {
        match self {
            Statement::Insert { table, columns, rows } => rows
                .into_iter()
                .map(|row| Statement::Insert {
                    table: table.clone(),
                    columns: columns.clone(),
                    rows: vec![row],
                })
                .collect(),
            Statement::Delete { table, key_columns, keys } => keys
                .into_iter()
                .map(|key| Statement::Delete {
                    table: table.clone(),
                    key_columns: key_columns.clone(),
                    keys: vec![key],
                })
                .collect(),
            other => vec![other],
        }
    }
}

/// An already connected database, as seen by the engine.
///
/// Every call is a network round-trip. Transaction and foreign-key-check
/// state is scoped to the handle's session.
#[async_trait]
pub trait DatabaseHandle: Send + Sync {
    /// Label used in logs ("remote", "local")
    fn label(&self) -> &str;

    /// Check the handle is usable
    async fn ping(&self) -> Result<()>;

    /// Names of all base tables
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Columns, keys and foreign keys of one table
    async fn table_schema(&self, table: &str) -> Result<TableSchema>;

    /// The server's own CREATE TABLE statement for a table
    async fn create_statement(&self, table: &str) -> Result<String>;

    async fn row_count(&self, table: &str) -> Result<u64>;

    /// All rows of a table, projected onto `columns`
    async fn fetch_rows(&self, table: &str, columns: &[String]) -> Result<Vec<Row>>;

    /// The `key_columns` tuple of every row
    async fn fetch_keys(&self, table: &str, key_columns: &[String]) -> Result<Vec<RowKey>>;

    /// Rows whose `key_columns` tuple is in `keys`, projected onto `columns`
    async fn fetch_rows_by_keys(
        &self,
        table: &str,
        columns: &[String],
        key_columns: &[String],
        keys: &[RowKey],
    ) -> Result<Vec<Row>>;

    /// Execute a statement, returning the number of affected rows
    async fn execute(&self, statement: &Statement) -> Result<u64>;

    async fn begin(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    async fn set_foreign_key_checks(&self, enabled: bool) -> Result<()>;

    /// Replace a broken session after a transient failure
    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }
}
