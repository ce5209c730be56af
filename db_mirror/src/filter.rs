//! Table exclusion
//!
//! An excluded table takes no part in the run: it never reaches the schema
//! diff, the dependency graph or the sync outcomes.

use std::collections::BTreeSet;

/// Exclusion predicate over table names
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    names: BTreeSet<String>,
    patterns: Vec<String>,
}

impl TableFilter {
    pub fn new(
        names: impl IntoIterator<Item = String>,
        patterns: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            names: names.into_iter().collect(),
            patterns: patterns
                .into_iter()
                .map(|p| p.to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Excluded by exact name, or when the name contains any pattern (case-insensitive)
    pub fn is_excluded(&self, table: &str) -> bool {
        if self.names.contains(table) {
            return true;
        }
        let lowered = table.to_lowercase();
        self.patterns.iter().any(|p| lowered.contains(p.as_str()))
    }

    pub fn is_included(&self, table: &str) -> bool {
        !self.is_excluded(table)
    }
}
