//! MySQL SQL generation
//!
//! Renders [`Statement`]s and row queries into SQL text plus the ordered list
//! of values to bind to its `?` placeholders.

use crate::db::handle::Statement;
use crate::db::value::{RowKey, Value};
use crate::schema::types::ColumnDef;

/// Most `?` placeholders MySQL accepts in one prepared statement
pub const MAX_PLACEHOLDERS: usize = 65_535;

/// Rows per statement when each row binds `width` values: at most
/// `batch_size`, and never more placeholders than MySQL allows
pub fn rows_per_statement(batch_size: usize, width: usize) -> usize {
    batch_size.min(MAX_PLACEHOLDERS / width.max(1)).max(1)
}

/// Quote an identifier with backticks
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn column_list(columns: &[String]) -> String {
    columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Column definition as used in `ADD COLUMN`
pub fn column_definition(column: &ColumnDef) -> String {
    let nullable = if column.nullable { "NULL" } else { "NOT NULL" };
    let default = match &column.default {
        Some(default_val) => format!(" DEFAULT {}", quote_default(&column.data_type, default_val)),
        None => String::new(),
    };

    format!(
        "{} {} {}{}",
        quote_ident(&column.name),
        column.data_type,
        nullable,
        default
    )
}

/// information_schema reports defaults unquoted; literals need quoting back
fn quote_default(data_type: &str, default_val: &str) -> String {
    let upper = default_val.to_uppercase();
    if upper == "NULL" || upper.starts_with("CURRENT_TIMESTAMP") || default_val.starts_with('(') {
        return default_val.to_string();
    }

    let numeric_type = ["int", "decimal", "float", "double", "bit", "numeric", "real"]
        .iter()
        .any(|t| data_type.to_lowercase().contains(t));
    if numeric_type && default_val.parse::<f64>().is_ok() {
        return default_val.to_string();
    }

    format!("'{}'", default_val.replace('\'', "''"))
}

/// `col = ?` for a single column key, `(a, b) IN ((?, ?), ...)` for tuples
fn key_predicate(key_columns: &[String], keys: &[RowKey]) -> (String, Vec<Value>) {
    let params: Vec<Value> = keys.iter().flat_map(|k| k.0.iter().cloned()).collect();

    if key_columns.len() == 1 {
        let sql = format!("{} IN ({})", quote_ident(&key_columns[0]), placeholders(keys.len()));
        return (sql, params);
    }

    let tuple = format!("({})", placeholders(key_columns.len()));
    let tuples = vec![tuple.as_str(); keys.len()].join(", ");
    (format!("({}) IN ({})", column_list(key_columns), tuples), params)
}

/// Render a statement; `ddl` statements carry no parameters
pub fn render(statement: &Statement) -> (String, Vec<Value>) {
    match statement {
        Statement::CreateTable { ddl, .. } => (ddl.clone(), Vec::new()),
        Statement::DropTable { table } => {
            (format!("DROP TABLE IF EXISTS {}", quote_ident(table)), Vec::new())
        }
        Statement::AddColumn { table, column } => (
            format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote_ident(table),
                column_definition(column)
            ),
            Vec::new(),
        ),
        Statement::Insert { table, columns, rows } => {
            let row_placeholder = format!("({})", placeholders(columns.len()));
            let values = vec![row_placeholder.as_str(); rows.len()].join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                quote_ident(table),
                column_list(columns),
                values
            );
            (sql, rows.iter().flatten().cloned().collect())
        }
        Statement::Update {
            table,
            columns,
            values,
            key_columns,
            key,
        } => {
            let set_clauses: Vec<String> =
                columns.iter().map(|c| format!("{} = ?", quote_ident(c))).collect();
            let where_clauses: Vec<String> =
                key_columns.iter().map(|c| format!("{} = ?", quote_ident(c))).collect();
            let sql = format!(
                "UPDATE {} SET {} WHERE {}",
                quote_ident(table),
                set_clauses.join(", "),
                where_clauses.join(" AND ")
            );
            let mut params = values.clone();
            params.extend(key.0.iter().cloned());
            (sql, params)
        }
        Statement::Delete { table, key_columns, keys } => {
            let (predicate, params) = key_predicate(key_columns, keys);
            (format!("DELETE FROM {} WHERE {}", quote_ident(table), predicate), params)
        }
    }
}

pub fn select_all(table: &str, columns: &[String]) -> String {
    format!("SELECT {} FROM {}", column_list(columns), quote_ident(table))
}

pub fn select_by_keys(
    table: &str,
    columns: &[String],
    key_columns: &[String],
    keys: &[RowKey],
) -> (String, Vec<Value>) {
    let (predicate, params) = key_predicate(key_columns, keys);
    (
        format!("{} WHERE {}", select_all(table, columns), predicate),
        params,
    )
}
