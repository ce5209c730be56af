//! Run statistics and the final report
//!
//! [`RunStatistics`] is an explicitly passed accumulator: each stage records
//! its per-table outcomes into it and it is handed back to the caller when the
//! run ends.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::graph::SyncUnit;
use crate::schema::diff::SchemaDiff;
use crate::schema::sync::SchemaChange;

/// Lifecycle of one table within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableState {
    Pending,
    Analyzed,
    Syncing,
    Done,
    Errored,
    Skipped,
}

impl TableState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TableState::Done | TableState::Errored | TableState::Skipped)
    }

    /// `PENDING -> ANALYZED -> {SYNCING -> {DONE | ERRORED}} | SKIPPED`
    pub fn can_transition_to(self, next: TableState) -> bool {
        use TableState::*;
        matches!(
            (self, next),
            (Pending, Analyzed)
                | (Pending, Skipped)
                | (Pending, Errored)
                | (Analyzed, Syncing)
                | (Analyzed, Skipped)
                | (Syncing, Done)
                | (Syncing, Errored)
        )
    }
}

/// Which row strategy handled a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Incremental,
    DropRecreate,
    MultiPass,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::Incremental => "incremental",
            StrategyKind::DropRecreate => "drop/recreate",
            StrategyKind::MultiPass => "multi-pass",
        };
        f.write_str(name)
    }
}

/// Row counts produced by syncing one table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCounts {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub constraint_violations: u64,
}

impl RowCounts {
    pub fn add(&mut self, other: RowCounts) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.constraint_violations += other.constraint_violations;
    }

    pub fn is_noop(&self) -> bool {
        self.inserted == 0 && self.updated == 0 && self.deleted == 0
    }
}

/// Final outcome of one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableOutcome {
    pub table: String,
    pub state: TableState,
    pub strategy: Option<StrategyKind>,
    pub rows: RowCounts,
    pub error: Option<String>,
    pub skip_reason: Option<String>,
    pub elapsed: Duration,
}

impl TableOutcome {
    pub fn done(table: &str, strategy: StrategyKind, rows: RowCounts, elapsed: Duration) -> Self {
        Self {
            table: table.to_string(),
            state: TableState::Done,
            strategy: Some(strategy),
            rows,
            error: None,
            skip_reason: None,
            elapsed,
        }
    }

    pub fn errored(table: &str, strategy: Option<StrategyKind>, error: impl ToString, elapsed: Duration) -> Self {
        Self {
            table: table.to_string(),
            state: TableState::Errored,
            strategy,
            rows: RowCounts::default(),
            error: Some(error.to_string()),
            skip_reason: None,
            elapsed,
        }
    }

    pub fn skipped(table: &str, reason: impl Into<String>) -> Self {
        Self {
            table: table.to_string(),
            state: TableState::Skipped,
            strategy: None,
            rows: RowCounts::default(),
            error: None,
            skip_reason: Some(reason.into()),
            elapsed: Duration::ZERO,
        }
    }
}

/// Aggregated counts and every per-table outcome of one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub tables_processed: usize,
    pub tables_synced: usize,
    pub tables_skipped: usize,
    pub tables_errored: usize,
    pub tables_created: usize,
    pub tables_dropped: usize,
    pub columns_added: usize,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_deleted: u64,
    pub rows_skipped: u64,
    pub constraint_violations: u64,
    pub orphans_deleted: u64,
    pub dry_run: bool,
    pub outcomes: Vec<TableOutcome>,
}

impl RunStatistics {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Default::default()
        }
    }

    /// Fold one table's final outcome into the totals
    pub fn record(&mut self, outcome: TableOutcome) {
        self.tables_processed += 1;
        match outcome.state {
            TableState::Done => self.tables_synced += 1,
            TableState::Skipped => self.tables_skipped += 1,
            TableState::Errored => self.tables_errored += 1,
            other => tracing::warn!(table = %outcome.table, state = ?other, "Recording non-terminal table state"),
        }
        self.rows_inserted += outcome.rows.inserted;
        self.rows_updated += outcome.rows.updated;
        self.rows_deleted += outcome.rows.deleted;
        self.rows_skipped += outcome.rows.skipped;
        self.constraint_violations += outcome.rows.constraint_violations;
        self.outcomes.push(outcome);
    }

    pub fn outcome(&self, table: &str) -> Option<&TableOutcome> {
        self.outcomes.iter().find(|o| o.table == table)
    }

    pub fn errored_tables(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.state == TableState::Errored)
            .map(|o| o.table.as_str())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.tables_errored == 0
    }
}

impl fmt::Display for RunStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Tables processed: {}", self.tables_processed)?;
        writeln!(f, "Tables synced:    {}", self.tables_synced)?;
        writeln!(f, "Tables skipped:   {}", self.tables_skipped)?;
        writeln!(f, "Tables errored:   {}", self.tables_errored)?;
        if self.tables_created > 0 || self.tables_dropped > 0 {
            writeln!(f, "Tables created:   {}", self.tables_created)?;
            writeln!(f, "Tables dropped:   {}", self.tables_dropped)?;
        }
        writeln!(f, "Rows inserted:    {}", self.rows_inserted)?;
        writeln!(f, "Rows updated:     {}", self.rows_updated)?;
        writeln!(f, "Rows deleted:     {}", self.rows_deleted)?;
        if self.constraint_violations > 0 {
            writeln!(f, "Constraint violations skipped: {}", self.constraint_violations)?;
        }
        if self.orphans_deleted > 0 {
            writeln!(f, "Orphan rows deleted: {}", self.orphans_deleted)?;
        }
        for outcome in &self.outcomes {
            match outcome.state {
                TableState::Errored => writeln!(
                    f,
                    "  ERROR   {}: {}",
                    outcome.table,
                    outcome.error.as_deref().unwrap_or("unknown error")
                )?,
                TableState::Skipped => writeln!(
                    f,
                    "  SKIPPED {}: {}",
                    outcome.table,
                    outcome.skip_reason.as_deref().unwrap_or("")
                )?,
                _ => {}
            }
        }
        Ok(())
    }
}

/// A table that failed before any sync decision could be made
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableError {
    pub table: String,
    pub message: String,
}

/// Everything a caller needs to render the outcome of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub diffs: Vec<SchemaDiff>,
    pub analysis_errors: Vec<TableError>,
    pub order: Vec<SyncUnit>,
    /// `(table, tables it depends on)`
    pub dependency_chains: Vec<(String, Vec<String>)>,
    pub schema_changes: Vec<SchemaChange>,
    pub recommendations: Vec<String>,
    pub statistics: RunStatistics,
}

impl SyncReport {
    pub fn missing_tables(&self) -> Vec<&str> {
        self.diffs
            .iter()
            .filter(|d| d.status == crate::schema::diff::DiffStatus::MissingLocally)
            .map(|d| d.table.as_str())
            .collect()
    }

    pub fn mismatched_tables(&self) -> Vec<&SchemaDiff> {
        self.diffs
            .iter()
            .filter(|d| d.status == crate::schema::diff::DiffStatus::Mismatched)
            .collect()
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let missing = self.missing_tables();
        if !missing.is_empty() {
            writeln!(f, "Missing locally: {}", missing.join(", "))?;
        }

        for diff in self.mismatched_tables() {
            writeln!(f, "Mismatched: {}", diff.table)?;
            for column in &diff.missing_columns {
                writeln!(f, "  missing column {} {}", column.name, column.data_type)?;
            }
            for mismatch in &diff.type_mismatches {
                writeln!(
                    f,
                    "  column {}: remote {} / local {}",
                    mismatch.column, mismatch.remote_type, mismatch.local_type
                )?;
            }
            if diff.primary_key_differs {
                writeln!(f, "  primary key differs")?;
            }
            if diff.foreign_keys_differ {
                writeln!(f, "  foreign keys differ")?;
            }
        }

        for error in &self.analysis_errors {
            writeln!(f, "Analysis failed: {}: {}", error.table, error.message)?;
        }

        for change in &self.schema_changes {
            let state = match (&change.error, change.applied) {
                (Some(_), _) => "failed",
                (None, true) => "applied",
                (None, false) => "planned",
            };
            writeln!(f, "[{}] {}: {:?}", state, change.table, change.action)?;
        }

        if self.statistics.dry_run || self.statistics.outcomes.is_empty() {
            for (table, deps) in &self.dependency_chains {
                writeln!(f, "{} depends on {}", table, deps.join(", "))?;
            }
        }

        for recommendation in &self.recommendations {
            writeln!(f, "* {}", recommendation)?;
        }

        write!(f, "{}", self.statistics)
    }
}
