//! Database connection handling
//!
//! This module provides the MySQL implementation of [`DatabaseHandle`]. Every
//! operation runs on one pinned session connection, so transactions and the
//! `FOREIGN_KEY_CHECKS` session variable apply to everything issued through
//! the handle. A replaced session gets that state replayed and the old
//! connection is closed rather than returned to the pool.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use sqlx::mysql::{MySqlArguments, MySqlConnection, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Column, Connection as _, Executor, FromRow, MySql, MySqlPool, Row as _, TypeInfo, ValueRef};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::DatabaseConfig;
use crate::db::handle::{DatabaseHandle, Statement};
use crate::db::session::{SessionCommand, SessionState};
use crate::db::sql;
use crate::db::value::{Row, RowKey, Value};
use crate::error::{Error, Result};
use crate::schema::types::{ColumnDef, ForeignKeyDef, KeyDef, KeyKind, TableSchema};

/// The pinned connection and what has been done to it
struct Session {
    conn: PoolConnection<MySql>,
    state: SessionState,
}

/// MySQL database handle
pub struct DatabaseConnection {
    label: String,
    pool: MySqlPool,
    session: Mutex<Session>,
}

impl DatabaseConnection {
    /// Create a new database connection from configuration
    pub async fn connect(label: &str, config: &DatabaseConfig) -> Result<Self> {
        let pool_size = config.pool_size.unwrap_or(2).max(1);
        let timeout_seconds = config.timeout_seconds.unwrap_or(60);

        let pool = MySqlPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(timeout_seconds))
            .connect(&config.url)
            .await
            .map_err(|e| Error::FatalConfiguration(format!("cannot connect to {} database: {}", label, e)))?;

        let session = pool
            .acquire()
            .await
            .map_err(|e| Error::FatalConfiguration(format!("cannot open {} session: {}", label, e)))?;

        tracing::info!(handle = label, "Database connection established");

        Ok(Self {
            label: label.to_string(),
            pool,
            session: Mutex::new(Session {
                conn: session,
                state: SessionState::default(),
            }),
        })
    }

    /// Close the pool once the run is over
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run a statement through the text protocol (transaction control, SET)
    async fn execute_raw(&self, conn: &mut MySqlConnection, sql: &str) -> Result<u64> {
        let result = conn
            .execute(sql)
            .await
            .map_err(|e| Error::from_sqlx(format!("{} {}", self.label, sql), e))?;
        Ok(result.rows_affected())
    }

    async fn fetch_values(&self, context: &str, sql: &str, params: Vec<Value>) -> Result<Vec<Row>> {
        let mut session = self.session.lock().await;
        let rows = bind_all(sqlx::query(sql), params)
            .fetch_all(&mut *session.conn)
            .await
            .map_err(|e| Error::from_sqlx(context, e))?;
        rows.iter().map(decode_row).collect()
    }
}

// Row types for information_schema queries
#[derive(FromRow)]
struct TableRow {
    table_name: String,
}

#[derive(FromRow)]
struct ColumnRow {
    column_name: String,
    column_type: String,
    is_nullable: String,
    column_default: Option<String>,
    ordinal_position: i64,
}

#[derive(FromRow)]
struct IndexRow {
    index_name: String,
    non_unique: i64,
    column_name: String,
}

#[derive(FromRow)]
struct ForeignKeyRow {
    constraint_name: String,
    column_name: String,
    ref_table: String,
    ref_column: String,
}

#[async_trait]
impl DatabaseHandle for DatabaseConnection {
    fn label(&self) -> &str {
        &self.label
    }

    async fn ping(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        sqlx::query("SELECT 1")
            .execute(&mut *session.conn)
            .await
            .map_err(|e| Error::from_sqlx(format!("{} ping", self.label), e))?;
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let sql = r#"
            SELECT CAST(table_name AS CHAR) AS table_name
            FROM information_schema.tables
            WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE'
            ORDER BY table_name
        "#;

        let mut session = self.session.lock().await;
        let rows = sqlx::query_as::<_, TableRow>(sql)
            .fetch_all(&mut *session.conn)
            .await
            .map_err(|e| Error::from_sqlx(format!("{} list tables", self.label), e))?;

        Ok(rows.into_iter().map(|r| r.table_name).collect())
    }

    async fn table_schema(&self, table_name: &str) -> Result<TableSchema> {
        let context = format!("{} metadata for {}", self.label, table_name);
        let mut session = self.session.lock().await;
        let mut table = TableSchema::new(table_name);

        // Get columns
        let sql = r#"
            SELECT
                CAST(column_name AS CHAR) AS column_name,
                CAST(column_type AS CHAR) AS column_type,
                CAST(is_nullable AS CHAR) AS is_nullable,
                CAST(column_default AS CHAR) AS column_default,
                CAST(ordinal_position AS SIGNED) AS ordinal_position
            FROM information_schema.columns
            WHERE table_schema = DATABASE() AND table_name = ?
            ORDER BY ordinal_position
        "#;

        let column_rows = sqlx::query_as::<_, ColumnRow>(sql)
            .bind(table_name)
            .fetch_all(&mut *session.conn)
            .await
            .map_err(|e| Error::from_sqlx(context.as_str(), e))?;

        if column_rows.is_empty() {
            return Err(Error::SchemaAnalysis(format!(
                "{} table {} has no columns or does not exist",
                self.label, table_name
            )));
        }

        for col in column_rows {
            table.add_column(ColumnDef {
                name: col.column_name,
                data_type: col.column_type,
                nullable: col.is_nullable == "YES",
                default: col.column_default,
                ordinal: col.ordinal_position as u32,
            })?;
        }

        // Get primary key, unique keys and indexes
        let sql = r#"
            SELECT
                CAST(index_name AS CHAR) AS index_name,
                CAST(non_unique AS SIGNED) AS non_unique,
                CAST(column_name AS CHAR) AS column_name
            FROM information_schema.statistics
            WHERE table_schema = DATABASE() AND table_name = ?
            ORDER BY index_name, seq_in_index
        "#;

        let index_rows = sqlx::query_as::<_, IndexRow>(sql)
            .bind(table_name)
            .fetch_all(&mut *session.conn)
            .await
            .map_err(|e| Error::from_sqlx(context.as_str(), e))?;

        let mut indexes: BTreeMap<String, KeyDef> = BTreeMap::new();
        for row in index_rows {
            let kind = if row.index_name == "PRIMARY" {
                KeyKind::Primary
            } else if row.non_unique == 0 {
                KeyKind::Unique
            } else {
                KeyKind::Index
            };

            indexes
                .entry(row.index_name.clone())
                .or_insert_with(|| KeyDef {
                    kind,
                    name: row.index_name,
                    columns: Vec::new(),
                })
                .columns
                .push(row.column_name);
        }
        table.keys = indexes.into_values().collect();

        // Get foreign keys
        let sql = r#"
            SELECT
                CAST(constraint_name AS CHAR) AS constraint_name,
                CAST(column_name AS CHAR) AS column_name,
                CAST(referenced_table_name AS CHAR) AS ref_table,
                CAST(referenced_column_name AS CHAR) AS ref_column
            FROM information_schema.key_column_usage
            WHERE table_schema = DATABASE()
              AND table_name = ?
              AND referenced_table_name IS NOT NULL
            ORDER BY constraint_name, ordinal_position
        "#;

        let fk_rows = sqlx::query_as::<_, ForeignKeyRow>(sql)
            .bind(table_name)
            .fetch_all(&mut *session.conn)
            .await
            .map_err(|e| Error::from_sqlx(context.as_str(), e))?;

        let mut foreign_keys: BTreeMap<String, ForeignKeyDef> = BTreeMap::new();
        for row in fk_rows {
            let fk = foreign_keys
                .entry(row.constraint_name.clone())
                .or_insert_with(|| ForeignKeyDef {
                    name: row.constraint_name,
                    columns: Vec::new(),
                    ref_table: row.ref_table,
                    ref_columns: Vec::new(),
                });
            fk.columns.push(row.column_name);
            fk.ref_columns.push(row.ref_column);
        }
        table.foreign_keys = foreign_keys.into_values().collect();

        Ok(table)
    }

    async fn create_statement(&self, table: &str) -> Result<String> {
        let sql = format!("SHOW CREATE TABLE {}", sql::quote_ident(table));
        let mut session = self.session.lock().await;
        let row = (&mut *session.conn)
            .fetch_one(sql.as_str())
            .await
            .map_err(|e| Error::from_sqlx(format!("{} show create {}", self.label, table), e))?;

        row.try_get::<String, _>(1)
            .map_err(|e| Error::Decode(format!("CREATE TABLE text for {}: {}", table, e)))
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        let sql = format!("SELECT CAST(COUNT(*) AS SIGNED) FROM {}", sql::quote_ident(table));
        let mut session = self.session.lock().await;
        let count: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&mut *session.conn)
            .await
            .map_err(|e| Error::from_sqlx(format!("{} count {}", self.label, table), e))?;
        Ok(count.max(0) as u64)
    }

    async fn fetch_rows(&self, table: &str, columns: &[String]) -> Result<Vec<Row>> {
        let context = format!("{} fetch rows of {}", self.label, table);
        self.fetch_values(&context, &sql::select_all(table, columns), Vec::new())
            .await
    }

    async fn fetch_keys(&self, table: &str, key_columns: &[String]) -> Result<Vec<RowKey>> {
        let context = format!("{} fetch keys of {}", self.label, table);
        let rows = self
            .fetch_values(&context, &sql::select_all(table, key_columns), Vec::new())
            .await?;
        Ok(rows.into_iter().map(RowKey).collect())
    }

    async fn fetch_rows_by_keys(
        &self,
        table: &str,
        columns: &[String],
        key_columns: &[String],
        keys: &[RowKey],
    ) -> Result<Vec<Row>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let context = format!("{} fetch {} rows of {}", self.label, keys.len(), table);
        let (sql, params) = sql::select_by_keys(table, columns, key_columns, keys);
        self.fetch_values(&context, &sql, params).await
    }

    async fn execute(&self, statement: &Statement) -> Result<u64> {
        let (sql, params) = sql::render(statement);
        let table = statement.table().to_string();

        let mut session = self.session.lock().await;
        if statement.is_ddl() {
            return self.execute_raw(&mut *session.conn, &sql).await.map_err(|e| match e {
                Error::Connectivity { .. } => e,
                other => Error::DdlApplication {
                    table,
                    message: other.to_string(),
                },
            });
        }

        let result = bind_all(sqlx::query(&sql), params)
            .execute(&mut *session.conn)
            .await
            .map_err(|e| Error::from_sqlx(table, e))?;
        Ok(result.rows_affected())
    }

    async fn begin(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        self.execute_raw(&mut *session.conn, SessionCommand::Begin.sql()).await?;
        session.state.begin();
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.state.end_transaction() {
            self.execute_raw(&mut *session.conn, "ROLLBACK").await?;
            return Err(Error::Connectivity {
                context: format!("{} commit", self.label),
                message: "session was replaced during the transaction, changes rolled back".to_string(),
            });
        }
        self.execute_raw(&mut *session.conn, "COMMIT").await.map(|_| ())
    }

    async fn rollback(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        session.state.end_transaction();
        self.execute_raw(&mut *session.conn, "ROLLBACK").await.map(|_| ())
    }

    async fn set_foreign_key_checks(&self, enabled: bool) -> Result<()> {
        let mut session = self.session.lock().await;
        let sql = SessionCommand::ForeignKeyChecks(enabled).sql();
        self.execute_raw(&mut *session.conn, sql).await?;
        session.state.set_foreign_key_checks(enabled);
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        let mut fresh = self
            .pool
            .acquire()
            .await
            .map_err(|e| Error::from_sqlx(format!("{} reconnect", self.label), e))?;

        let mut session = self.session.lock().await;
        for command in session.state.replay() {
            if let Err(e) = self.execute_raw(&mut *fresh, command.sql()).await {
                discard(&self.label, fresh).await;
                return Err(e);
            }
        }

        let stale = std::mem::replace(&mut session.conn, fresh);
        drop(session);
        discard(&self.label, stale).await;
        tracing::info!(handle = %self.label, "Session replaced");
        Ok(())
    }
}

/// Close a connection instead of returning it to the pool, where its session
/// variables would leak into the next acquire
async fn discard(label: &str, conn: PoolConnection<MySql>) {
    if let Err(e) = conn.detach().close().await {
        tracing::debug!(handle = %label, error = %e, "Closing stale session failed");
    }
}

fn bind_all<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    params: Vec<Value>,
) -> Query<'q, MySql, MySqlArguments> {
    for value in params {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Int(v) => query.bind(v),
            Value::UInt(v) => query.bind(v),
            Value::Float(v) => query.bind(v),
            Value::Decimal(v) | Value::Text(v) => query.bind(v),
            Value::Bytes(v) => query.bind(v),
            Value::Date(v) => query.bind(v),
            Value::Time(v) => query.bind(v),
            Value::DateTime(v) => query.bind(v),
            Value::Timestamp(v) => query.bind(v),
            Value::Json(v) => query.bind(sqlx::types::Json(v)),
        };
    }
    query
}

/// Decode every column of a row into its logical [`Value`]
fn decode_row(row: &MySqlRow) -> Result<Row> {
    (0..row.columns().len()).map(|i| decode_column(row, i)).collect()
}

fn decode_column(row: &MySqlRow, index: usize) -> Result<Value> {
    let raw = row
        .try_get_raw(index)
        .map_err(|e| Error::Decode(e.to_string()))?;
    if raw.is_null() {
        return Ok(Value::Null);
    }

    let column = &row.columns()[index];
    let type_name = column.type_info().name();
    let decode_err = |e: sqlx::Error| Error::Decode(format!("column {} ({}): {}", column.name(), type_name, e));

    let value = match type_name {
        "BOOLEAN" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            Value::Int(row.try_get::<i64, _>(index).map_err(decode_err)?)
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => Value::UInt(row.try_get::<u64, _>(index).map_err(decode_err)?),
        "FLOAT" | "DOUBLE" => Value::Float(row.try_get::<f64, _>(index).map_err(decode_err)?),
        "YEAR" => Value::Int(i64::from(row.try_get_unchecked::<u16, _>(index).map_err(decode_err)?)),
        "DATE" | "TIME" | "DATETIME" | "TIMESTAMP" => {
            let bytes = row.try_get_unchecked::<Vec<u8>, _>(index).map_err(decode_err)?;
            decode_temporal(type_name, &bytes).ok_or_else(|| {
                Error::Decode(format!("column {} ({}): malformed value", column.name(), type_name))
            })?
        }
        "JSON" => Value::Json(row.try_get(index).map_err(decode_err)?),
        "DECIMAL" => Value::Decimal(decode_text(row, index).map_err(decode_err)?),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT"
        | "GEOMETRY" => Value::Bytes(row.try_get::<Vec<u8>, _>(index).map_err(decode_err)?),
        _ => Value::Text(decode_text(row, index).map_err(decode_err)?),
    };

    Ok(value)
}

/// Text-like values; falls back to the raw bytes for types sqlx won't map to String
fn decode_text(row: &MySqlRow, index: usize) -> std::result::Result<String, sqlx::Error> {
    row.try_get::<String, _>(index).or_else(|_| {
        row.try_get_unchecked::<Vec<u8>, _>(index)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    })
}

/// Decode a DATE, TIME, DATETIME or TIMESTAMP column from its wire bytes.
///
/// Values chrono can hold become typed values. Zero dates and TIME values
/// outside one day (MySQL allows -838:59:59 to 838:59:59) are kept as their
/// MySQL text so they round-trip unchanged.
fn decode_temporal(type_name: &str, bytes: &[u8]) -> Option<Value> {
    match bytes.first() {
        // binary protocol values start with their length: 0, 4, 7, 8, 11 or 12
        Some(&len) if len <= 12 => decode_binary_temporal(type_name, &bytes[1..], len as usize),
        Some(_) => decode_text_temporal(type_name, std::str::from_utf8(bytes).ok()?),
        None => None,
    }
}

fn decode_binary_temporal(type_name: &str, body: &[u8], len: usize) -> Option<Value> {
    if body.len() < len {
        return None;
    }
    let micros_at = |at: usize| -> u32 {
        body.get(at..at + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(0)
    };

    if type_name == "TIME" {
        let (negative, days, hour, minute, second) = if len >= 8 {
            let days = u32::from_le_bytes([body[1], body[2], body[3], body[4]]);
            (body[0] == 1, days, body[5], body[6], body[7])
        } else {
            (false, 0, 0, 0, 0)
        };
        let micros = if len >= 12 { micros_at(8) } else { 0 };
        if !negative && days == 0 {
            if let Some(time) = NaiveTime::from_hms_micro_opt(hour.into(), minute.into(), second.into(), micros) {
                return Some(Value::Time(time));
            }
        }
        let hours = u64::from(days) * 24 + u64::from(hour);
        let sign = if negative { "-" } else { "" };
        return Some(Value::Text(format!(
            "{}{:02}:{:02}:{:02}{}",
            sign,
            hours,
            minute,
            second,
            fraction(micros)
        )));
    }

    let (year, month, day) = if len >= 4 {
        (u16::from_le_bytes([body[0], body[1]]), body[2], body[3])
    } else {
        (0, 0, 0)
    };
    let (hour, minute, second) = if len >= 7 { (body[4], body[5], body[6]) } else { (0, 0, 0) };
    let micros = if len >= 11 { micros_at(7) } else { 0 };

    let date = NaiveDate::from_ymd_opt(year.into(), month.into(), day.into());
    if type_name == "DATE" {
        return Some(match date {
            Some(date) => Value::Date(date),
            None => Value::Text(format!("{:04}-{:02}-{:02}", year, month, day)),
        });
    }

    let datetime = date.and_then(|d| d.and_hms_micro_opt(hour.into(), minute.into(), second.into(), micros));
    Some(match datetime {
        Some(dt) if type_name == "TIMESTAMP" => Value::Timestamp(dt.and_utc()),
        Some(dt) => Value::DateTime(dt),
        None => Value::Text(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}{}",
            year,
            month,
            day,
            hour,
            minute,
            second,
            fraction(micros)
        )),
    })
}

fn decode_text_temporal(type_name: &str, text: &str) -> Option<Value> {
    let typed = match type_name {
        "DATE" => NaiveDate::parse_from_str(text, "%Y-%m-%d").ok().map(Value::Date),
        "TIME" => NaiveTime::parse_from_str(text, "%H:%M:%S%.f").ok().map(Value::Time),
        "DATETIME" => chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .map(Value::DateTime),
        _ => chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .map(|dt| Value::Timestamp(dt.and_utc())),
    };
    Some(typed.unwrap_or_else(|| Value::Text(text.to_string())))
}

fn fraction(micros: u32) -> String {
    if micros == 0 {
        String::new()
    } else {
        format!(".{:06}", micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn time(h: u32, m: u32, s: u32) -> Value {
        Value::Time(NaiveTime::from_hms_opt(h, m, s).unwrap())
    }

    #[rstest]
    #[case::midnight(&[0], time(0, 0, 0))]
    #[case::within_a_day(&[8, 0, 0, 0, 0, 0, 13, 5, 9], time(13, 5, 9))]
    #[case::past_a_day(&[8, 0, 1, 0, 0, 0, 2, 0, 0], Value::from("26:00:00"))]
    #[case::negative_max(&[8, 1, 34, 0, 0, 0, 22, 59, 59], Value::from("-838:59:59"))]
    #[case::with_fraction(&[12, 1, 0, 0, 0, 0, 1, 2, 3, 0x40, 0xE2, 0x01, 0x00], Value::from("-01:02:03.123456"))]
    fn test_binary_time(#[case] bytes: &[u8], #[case] expected: Value) {
        assert_eq!(decode_temporal("TIME", bytes), Some(expected));
    }

    #[test]
    fn test_binary_dates() {
        let leap_day = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(
            decode_temporal("DATE", &[4, 0xE8, 0x07, 2, 29]),
            Some(Value::Date(leap_day))
        );
        assert_eq!(
            decode_temporal("DATETIME", &[11, 0xE8, 0x07, 2, 29, 4, 5, 6, 0x40, 0xE2, 0x01, 0x00]),
            Some(Value::DateTime(leap_day.and_hms_micro_opt(4, 5, 6, 123_456).unwrap()))
        );
        assert_eq!(
            decode_temporal("TIMESTAMP", &[7, 0xE8, 0x07, 2, 29, 4, 5, 6]),
            Some(Value::Timestamp(leap_day.and_hms_opt(4, 5, 6).unwrap().and_utc()))
        );
    }

    #[test]
    fn test_zero_dates_are_kept_as_text() {
        assert_eq!(decode_temporal("DATE", &[0]), Some(Value::from("0000-00-00")));
        assert_eq!(
            decode_temporal("DATETIME", &[0]),
            Some(Value::from("0000-00-00 00:00:00"))
        );
        assert_eq!(
            decode_temporal("DATE", &[4, 0xE8, 0x07, 0, 0]),
            Some(Value::from("2024-00-00"))
        );
    }

    #[test]
    fn test_text_protocol_values() {
        assert_eq!(decode_temporal("TIME", b"13:05:09"), Some(time(13, 5, 9)));
        assert_eq!(decode_temporal("TIME", b"-838:59:59"), Some(Value::from("-838:59:59")));
        assert_eq!(decode_temporal("DATE", b"0000-00-00"), Some(Value::from("0000-00-00")));
    }

    #[test]
    fn test_truncated_value_is_rejected() {
        assert_eq!(decode_temporal("DATE", &[4, 0xE8, 0x07]), None);
        assert_eq!(decode_temporal("TIME", &[]), None);
    }
}
