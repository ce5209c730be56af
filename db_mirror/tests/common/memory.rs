//! In-memory DatabaseHandle for engine tests.
//!
//! Behaves like a small InnoDB database: primary keys are unique, foreign keys
//! are enforced on insert, update and delete unless checks are switched off,
//! multi-row statements are atomic, and a transaction can be rolled back.
//! Failures can be injected per table.
//!
//! A reconnect behaves like a new server session: foreign-key checks are back
//! on and an open transaction is gone. The handle then replays its
//! [`SessionState`], as the MySQL handle does.

use async_trait::async_trait;
use db_mirror::db::sql::MAX_PLACEHOLDERS;
use db_mirror::db::{DatabaseHandle, Row, RowKey, SessionCommand, SessionState, Statement, Value};
use db_mirror::schema::TableSchema;
use db_mirror::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct MemTable {
    schema: TableSchema,
    rows: Vec<Row>,
}

#[derive(Default)]
struct Faults {
    /// Tables whose metadata cannot be read
    metadata: HashSet<String>,
    /// Tables where every write fails with a generic error
    writes: HashSet<String>,
    /// Tables where every row write is rejected as a constraint violation
    reject: HashSet<String>,
    /// Number of upcoming reads that fail transiently
    transient_reads: u32,
    /// Upcoming key reads of a table that fail transiently
    transient_keys: HashMap<String, u32>,
    /// Tables whose next write drops the session
    drop_session: HashSet<String>,
    unreachable: bool,
}

struct State {
    tables: BTreeMap<String, MemTable>,
    snapshot: Option<BTreeMap<String, MemTable>>,
    fk_checks: bool,
    session: SessionState,
    /// The session died; everything fails until a reconnect
    broken: bool,
    faults: Faults,
    executed: usize,
    reconnects: usize,
}

pub struct MemoryDatabase {
    label: String,
    state: Mutex<State>,
}

impl MemoryDatabase {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            state: Mutex::new(State {
                tables: BTreeMap::new(),
                snapshot: None,
                fk_checks: true,
                session: SessionState::default(),
                broken: false,
                faults: Faults::default(),
                executed: 0,
                reconnects: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Add a table with rows given in the schema's column order
    pub fn with_table(self, schema: TableSchema, rows: Vec<Row>) -> Self {
        self.lock().tables.insert(schema.name.clone(), MemTable { schema, rows });
        self
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.lock().tables.contains_key(table)
    }

    pub fn schema(&self, table: &str) -> TableSchema {
        self.lock().tables[table].schema.clone()
    }

    /// Rows rendered as text and sorted, for order-independent comparison
    pub fn dump(&self, table: &str) -> Vec<String> {
        let state = self.lock();
        let mut rows: Vec<String> = state.tables[table]
            .rows
            .iter()
            .map(|row| RowKey(row.clone()).to_string())
            .collect();
        rows.sort();
        rows
    }

    pub fn count(&self, table: &str) -> usize {
        self.lock().tables[table].rows.len()
    }

    /// Insert rows directly, bypassing constraints
    pub fn push_rows(&self, table: &str, rows: Vec<Row>) {
        self.lock().tables.get_mut(table).unwrap().rows.extend(rows);
    }

    /// Replace the value of `column` in the row whose first column equals `id`
    pub fn set_value(&self, table: &str, id: Value, column: &str, value: Value) {
        let mut state = self.lock();
        let t = state.tables.get_mut(table).unwrap();
        let pos = t.schema.positions(&[column.to_string()]).unwrap()[0];
        let row = t.rows.iter_mut().find(|r| r[0] == id).unwrap();
        row[pos] = value;
    }

    pub fn remove_row(&self, table: &str, id: Value) {
        self.lock().tables.get_mut(table).unwrap().rows.retain(|r| r[0] != id);
    }

    pub fn fail_metadata(&self, table: &str) {
        self.lock().faults.metadata.insert(table.to_string());
    }

    pub fn fail_writes(&self, table: &str) {
        self.lock().faults.writes.insert(table.to_string());
    }

    pub fn reject_rows(&self, table: &str) {
        self.lock().faults.reject.insert(table.to_string());
    }

    pub fn fail_reads_transiently(&self, times: u32) {
        self.lock().faults.transient_reads = times;
    }

    /// Fail the next `times` key reads of `table` transiently
    pub fn fail_keys_transiently(&self, table: &str, times: u32) {
        self.lock().faults.transient_keys.insert(table.to_string(), times);
    }

    /// The next write to `table` loses the connection
    pub fn drop_session_on_write(&self, table: &str) {
        self.lock().faults.drop_session.insert(table.to_string());
    }

    pub fn set_unreachable(&self) {
        self.lock().faults.unreachable = true;
    }

    /// Number of statements passed to `execute`, successful or not
    pub fn executed(&self) -> usize {
        self.lock().executed
    }

    pub fn reconnects(&self) -> usize {
        self.lock().reconnects
    }

    pub fn foreign_key_checks(&self) -> bool {
        self.lock().fk_checks
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().snapshot.is_some()
    }
}

fn transient(context: &str) -> Error {
    Error::Connectivity {
        context: context.to_string(),
        message: "connection reset".to_string(),
    }
}

impl State {
    fn alive(&self, label: &str) -> Result<()> {
        if self.broken {
            return Err(transient(label));
        }
        Ok(())
    }

    fn transient_read(&mut self, label: &str) -> Result<()> {
        self.alive(label)?;
        if self.faults.transient_reads > 0 {
            self.faults.transient_reads -= 1;
            return Err(transient(label));
        }
        Ok(())
    }

    fn transient_keys(&mut self, label: &str, table: &str) -> Result<()> {
        self.transient_read(label)?;
        if let Some(left) = self.faults.transient_keys.get_mut(table) {
            if *left > 0 {
                *left -= 1;
                return Err(transient(label));
            }
        }
        Ok(())
    }

    /// The connection died: the server discards the open transaction
    fn drop_session(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.tables = snapshot;
        }
        self.broken = true;
    }

    /// A new session, brought back to the state the handle recorded
    fn reconnect(&mut self) {
        self.reconnects += 1;
        self.broken = false;
        self.fk_checks = true;
        if let Some(snapshot) = self.snapshot.take() {
            self.tables = snapshot;
        }
        for command in self.session.replay() {
            match command {
                SessionCommand::ForeignKeyChecks(enabled) => self.fk_checks = enabled,
                SessionCommand::Begin => self.snapshot = Some(self.tables.clone()),
            }
        }
    }

    fn table(&self, table: &str) -> Result<&MemTable> {
        self.tables
            .get(table)
            .ok_or_else(|| Error::Database(format!("Table '{}' doesn't exist", table)))
    }

    fn positions(table: &MemTable, columns: &[String]) -> Result<Vec<usize>> {
        table
            .schema
            .positions(columns)
            .ok_or_else(|| Error::Database(format!("Unknown column in {}", table.schema.name)))
    }

    fn project(&self, table: &str, columns: &[String]) -> Result<Vec<Row>> {
        let t = self.table(table)?;
        let positions = Self::positions(t, columns)?;
        Ok(t.rows
            .iter()
            .map(|row| positions.iter().map(|&i| row[i].clone()).collect())
            .collect())
    }

    /// Whether `table` has a row whose `columns` equal `key`, also looking at `pending` rows of it
    fn has_key(&self, table: &str, columns: &[String], key: &RowKey, pending: &[Row]) -> bool {
        let Some(t) = self.tables.get(table) else {
            return false;
        };
        let Some(positions) = t.schema.positions(columns) else {
            return false;
        };
        t.rows
            .iter()
            .chain(pending.iter())
            .any(|row| &RowKey::project(row, &positions) == key)
    }

    fn check_references(&self, schema: &TableSchema, row: &Row, pending: &[Row]) -> Result<()> {
        for fk in &schema.foreign_keys {
            let Some(positions) = schema.positions(&fk.columns) else {
                continue;
            };
            let key = RowKey::project(row, &positions);
            if key.has_null() {
                continue;
            }
            let same_table: &[Row] = if fk.ref_table == schema.name { pending } else { &[] };
            if !self.has_key(&fk.ref_table, &fk.ref_columns, &key, same_table) {
                return Err(Error::ConstraintViolation {
                    table: schema.name.clone(),
                    message: format!(
                        "Cannot add or update a child row: {} references {}{}",
                        fk.name, fk.ref_table, key
                    ),
                });
            }
        }
        Ok(())
    }

    /// Fail if any row outside `doomed` references one of the `doomed` rows of `table`
    fn check_not_referenced(&self, table: &MemTable, doomed: &[Row]) -> Result<()> {
        for child in self.tables.values() {
            for fk in child.schema.foreign_keys.iter().filter(|fk| fk.ref_table == table.schema.name) {
                let (Some(child_pos), Some(parent_pos)) = (
                    child.schema.positions(&fk.columns),
                    table.schema.positions(&fk.ref_columns),
                ) else {
                    continue;
                };
                for parent in doomed {
                    let parent_key = RowKey::project(parent, &parent_pos);
                    let referenced = child
                        .rows
                        .iter()
                        .filter(|row| child.schema.name != table.schema.name || !doomed.contains(row))
                        .any(|row| RowKey::project(row, &child_pos) == parent_key);
                    if referenced {
                        return Err(Error::ConstraintViolation {
                            table: table.schema.name.clone(),
                            message: format!(
                                "Cannot delete or update a parent row: {}.{} references {}",
                                child.schema.name, fk.name, parent_key
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn execute(&mut self, statement: &Statement) -> Result<u64> {
        self.executed += 1;
        let name = statement.table().to_string();
        self.alive(&name)?;
        if self.faults.drop_session.remove(&name) {
            self.drop_session();
            return Err(transient(&name));
        }
        if self.faults.writes.contains(&name) {
            return Err(Error::Database(format!("injected failure writing {}", name)));
        }
        if !statement.is_ddl() && self.faults.reject.contains(&name) {
            return Err(Error::ConstraintViolation {
                table: name,
                message: "injected constraint violation".to_string(),
            });
        }

        match statement {
            Statement::CreateTable { schema, .. } => {
                if self.tables.contains_key(&name) {
                    return Err(Error::DdlApplication {
                        table: name,
                        message: "Table already exists".to_string(),
                    });
                }
                self.tables.insert(
                    name,
                    MemTable {
                        schema: schema.clone(),
                        rows: Vec::new(),
                    },
                );
                Ok(0)
            }
            Statement::DropTable { table } => {
                self.tables.remove(table);
                Ok(0)
            }
            Statement::AddColumn { table, column } => {
                let t = self.tables.get_mut(table).ok_or_else(|| Error::DdlApplication {
                    table: table.clone(),
                    message: "Table doesn't exist".to_string(),
                })?;
                let mut column = column.clone();
                column.ordinal = 0;
                t.schema.add_column(column).map_err(|e| Error::DdlApplication {
                    table: table.clone(),
                    message: e.to_string(),
                })?;
                for row in &mut t.rows {
                    row.push(Value::Null);
                }
                Ok(0)
            }
            Statement::Insert { table, columns, rows } => self.insert(table, columns, rows),
            Statement::Update {
                table,
                columns,
                values,
                key_columns,
                key,
            } => self.update(table, columns, values, key_columns, key),
            Statement::Delete { table, key_columns, keys } => self.delete(table, key_columns, keys),
        }
    }

    fn insert(&mut self, table: &str, columns: &[String], rows: &[Row]) -> Result<u64> {
        if rows.len() * columns.len() > MAX_PLACEHOLDERS {
            return Err(Error::Database(
                "Prepared statement contains too many placeholders".to_string(),
            ));
        }
        let t = self.table(table)?;
        let schema = t.schema.clone();
        let positions = Self::positions(t, columns)?;
        let pk = schema.positions(&schema.primary_key()).unwrap_or_default();

        let mut new_rows: Vec<Row> = Vec::new();
        for row in rows {
            let mut full = vec![Value::Null; schema.columns.len()];
            for (value, &pos) in row.iter().zip(&positions) {
                full[pos] = value.clone();
            }
            if !pk.is_empty() {
                let key = RowKey::project(&full, &pk);
                let duplicate = t
                    .rows
                    .iter()
                    .chain(new_rows.iter())
                    .any(|r| RowKey::project(r, &pk) == key);
                if duplicate {
                    return Err(Error::ConstraintViolation {
                        table: table.to_string(),
                        message: format!("Duplicate entry {} for key 'PRIMARY'", key),
                    });
                }
            }
            if self.fk_checks {
                let mut visible = new_rows.clone();
                visible.push(full.clone());
                self.check_references(&schema, &full, &visible)?;
            }
            new_rows.push(full);
        }

        let count = new_rows.len() as u64;
        if let Some(t) = self.tables.get_mut(table) {
            t.rows.extend(new_rows);
        }
        Ok(count)
    }

    fn update(
        &mut self,
        table: &str,
        columns: &[String],
        values: &Row,
        key_columns: &[String],
        key: &RowKey,
    ) -> Result<u64> {
        let t = self.table(table)?;
        let schema = t.schema.clone();
        let set_positions = Self::positions(t, columns)?;
        let key_positions = Self::positions(t, key_columns)?;

        let Some(index) = t.rows.iter().position(|r| &RowKey::project(r, &key_positions) == key) else {
            return Ok(0);
        };
        let mut updated = t.rows[index].clone();
        for (value, &pos) in values.iter().zip(&set_positions) {
            updated[pos] = value.clone();
        }
        if self.fk_checks {
            self.check_references(&schema, &updated, &[])?;
        }

        if let Some(t) = self.tables.get_mut(table) {
            t.rows[index] = updated;
        }
        Ok(1)
    }

    fn delete(&mut self, table: &str, key_columns: &[String], keys: &[RowKey]) -> Result<u64> {
        let t = self.table(table)?;
        let key_positions = Self::positions(t, key_columns)?;
        let doomed: Vec<Row> = t
            .rows
            .iter()
            .filter(|r| keys.contains(&RowKey::project(r, &key_positions)))
            .cloned()
            .collect();
        if self.fk_checks {
            self.check_not_referenced(t, &doomed)?;
        }

        let count = doomed.len() as u64;
        if let Some(t) = self.tables.get_mut(table) {
            t.rows.retain(|r| !doomed.contains(r));
        }
        Ok(count)
    }
}

fn create_statement(schema: &TableSchema) -> String {
    let columns: Vec<String> = schema
        .columns
        .iter()
        .map(|c| format!("  `{}` {}", c.name, c.data_type))
        .collect();
    format!("CREATE TABLE `{}` (\n{}\n)", schema.name, columns.join(",\n"))
}

#[async_trait]
impl DatabaseHandle for MemoryDatabase {
    fn label(&self) -> &str {
        &self.label
    }

    async fn ping(&self) -> Result<()> {
        if self.lock().faults.unreachable {
            return Err(Error::Connectivity {
                context: format!("connect to {}", self.label),
                message: "Can't connect to MySQL server".to_string(),
            });
        }
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.transient_read(&self.label)?;
        Ok(state.tables.keys().cloned().collect())
    }

    async fn table_schema(&self, table: &str) -> Result<TableSchema> {
        let state = self.lock();
        state.alive(&self.label)?;
        if state.faults.metadata.contains(table) {
            return Err(Error::SchemaAnalysis(format!(
                "SELECT command denied for information_schema on {}",
                table
            )));
        }
        Ok(state.table(table)?.schema.clone())
    }

    async fn create_statement(&self, table: &str) -> Result<String> {
        let state = self.lock();
        state.alive(&self.label)?;
        Ok(create_statement(&state.table(table)?.schema))
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        let state = self.lock();
        state.alive(&self.label)?;
        Ok(state.table(table)?.rows.len() as u64)
    }

    async fn fetch_rows(&self, table: &str, columns: &[String]) -> Result<Vec<Row>> {
        let mut state = self.lock();
        state.transient_read(&self.label)?;
        state.project(table, columns)
    }

    async fn fetch_keys(&self, table: &str, key_columns: &[String]) -> Result<Vec<RowKey>> {
        let mut state = self.lock();
        state.transient_keys(&self.label, table)?;
        Ok(state.project(table, key_columns)?.into_iter().map(RowKey).collect())
    }

    async fn fetch_rows_by_keys(
        &self,
        table: &str,
        columns: &[String],
        key_columns: &[String],
        keys: &[RowKey],
    ) -> Result<Vec<Row>> {
        let mut state = self.lock();
        state.transient_read(&self.label)?;
        let t = state.table(table)?;
        let positions = State::positions(t, columns)?;
        let key_positions = State::positions(t, key_columns)?;
        Ok(t.rows
            .iter()
            .filter(|row| keys.contains(&RowKey::project(row, &key_positions)))
            .map(|row| positions.iter().map(|&i| row[i].clone()).collect())
            .collect())
    }

    async fn execute(&self, statement: &Statement) -> Result<u64> {
        self.lock().execute(statement)
    }

    async fn begin(&self) -> Result<()> {
        let mut state = self.lock();
        state.alive(&self.label)?;
        state.snapshot = Some(state.tables.clone());
        state.session.begin();
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.lock();
        if state.session.end_transaction() {
            if let Some(snapshot) = state.snapshot.take() {
                state.tables = snapshot;
            }
            return Err(transient("commit after reconnect"));
        }
        state.alive(&self.label)?;
        state.snapshot = None;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.lock();
        state.session.end_transaction();
        state.alive(&self.label)?;
        if let Some(snapshot) = state.snapshot.take() {
            state.tables = snapshot;
        }
        Ok(())
    }

    async fn set_foreign_key_checks(&self, enabled: bool) -> Result<()> {
        let mut state = self.lock();
        state.alive(&self.label)?;
        state.fk_checks = enabled;
        state.session.set_foreign_key_checks(enabled);
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        self.lock().reconnect();
        Ok(())
    }
}
