//! Foreign-key dependency graph and processing order
//!
//! An edge `A -> B` means "A has a foreign key referencing B", so B must be
//! synchronized before A. Tables that reference each other in a cycle cannot
//! be strictly ordered; they are returned together as a
//! [`SyncUnit::CircularGroup`] and the data layer relaxes foreign-key checks
//! for them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::config::OrderStrategy;
use crate::filter::TableFilter;
use crate::schema::types::ForeignKeyDef;

/// Directed graph of table dependencies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    nodes: BTreeSet<String>,
    edges: BTreeMap<String, BTreeSet<String>>,
    self_referencing: BTreeSet<String>,
}

impl DependencyGraph {
    /// Build the graph for `tables` from their foreign keys.
    ///
    /// Excluded tables are dropped entirely, and so are edges pointing at
    /// them or at any table outside `tables`.
    pub fn build<'a>(
        tables: impl IntoIterator<Item = &'a str>,
        foreign_keys: impl IntoIterator<Item = (&'a str, &'a ForeignKeyDef)>,
        filter: &TableFilter,
    ) -> Self {
        let mut graph = Self::default();
        for table in tables {
            if filter.is_included(table) {
                graph.nodes.insert(table.to_string());
            }
        }

        for (table, fk) in foreign_keys {
            graph.add_edge(table, &fk.ref_table);
        }

        graph
    }

    /// Record that `from` depends on `to`; ignored unless both are nodes
    pub fn add_edge(&mut self, from: &str, to: &str) {
        if !self.nodes.contains(from) || !self.nodes.contains(to) {
            return;
        }
        if from == to {
            self.self_referencing.insert(from.to_string());
            return;
        }
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
    }

    pub fn add_node(&mut self, table: &str) {
        self.nodes.insert(table.to_string());
    }

    pub fn contains(&self, table: &str) -> bool {
        self.nodes.contains(table)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Tables `table` directly depends on
    pub fn dependencies(&self, table: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(table)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.edges.get(from).is_some_and(|deps| deps.contains(to))
    }

    pub fn is_self_referencing(&self, table: &str) -> bool {
        self.self_referencing.contains(table)
    }

    /// `(table, dependencies)` for every table with at least one dependency
    pub fn chains(&self) -> Vec<(String, Vec<String>)> {
        self.edges
            .iter()
            .map(|(table, deps)| (table.clone(), deps.iter().cloned().collect()))
            .collect()
    }
}

/// One step of the processing order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "tables", rename_all = "snake_case")]
pub enum SyncUnit {
    Ordered(String),
    /// Tables whose foreign keys form a cycle; internal order is arbitrary
    CircularGroup(Vec<String>),
}

impl SyncUnit {
    pub fn tables(&self) -> Vec<&str> {
        match self {
            SyncUnit::Ordered(t) => vec![t.as_str()],
            SyncUnit::CircularGroup(ts) => ts.iter().map(String::as_str).collect(),
        }
    }

    pub fn is_circular(&self) -> bool {
        matches!(self, SyncUnit::CircularGroup(_))
    }

    fn first(&self) -> &str {
        match self {
            SyncUnit::Ordered(t) => t,
            SyncUnit::CircularGroup(ts) => ts.first().map(String::as_str).unwrap_or(""),
        }
    }
}

/// Flatten units into a table sequence
pub fn flatten(units: &[SyncUnit]) -> Vec<String> {
    units
        .iter()
        .flat_map(|u| u.tables().into_iter().map(str::to_string))
        .collect()
}

/// Computes a safe processing order from a [`DependencyGraph`]
pub struct DependencyResolver<'a> {
    graph: &'a DependencyGraph,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(graph: &'a DependencyGraph) -> Self {
        Self { graph }
    }

    /// Order according to the configured strategy
    pub fn order(&self, strategy: OrderStrategy, custom_prefix: &[String]) -> Vec<SyncUnit> {
        match strategy {
            OrderStrategy::Dependency => self.resolve(),
            OrderStrategy::Alphabetical => self
                .graph
                .nodes()
                .map(|t| SyncUnit::Ordered(t.to_string()))
                .collect(),
            OrderStrategy::CustomPrefix => self.resolve_with_prefix(custom_prefix),
        }
    }

    /// Dependencies first. Among units that are ready at the same time the
    /// alphabetically smallest goes first, so identical schemas always
    /// produce identical orders.
    pub fn resolve(&self) -> Vec<SyncUnit> {
        let components = self.strongly_connected_components();

        let mut unit_of: HashMap<&str, usize> = HashMap::new();
        let units: Vec<SyncUnit> = components
            .into_iter()
            .enumerate()
            .map(|(i, mut members)| {
                members.sort();
                for &m in &members {
                    unit_of.insert(m, i);
                }
                if members.len() == 1 {
                    SyncUnit::Ordered(members[0].to_string())
                } else {
                    SyncUnit::CircularGroup(members.into_iter().map(str::to_string).collect())
                }
            })
            .collect();

        // Condensed graph: unit -> units it depends on
        let mut pending_deps: Vec<HashSet<usize>> = vec![HashSet::new(); units.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); units.len()];
        for (i, unit) in units.iter().enumerate() {
            for table in unit.tables() {
                for dep in self.graph.dependencies(table) {
                    let j = unit_of[dep];
                    if i != j && pending_deps[i].insert(j) {
                        dependents[j].push(i);
                    }
                }
            }
        }

        let mut ready: BTreeSet<(&str, usize)> = units
            .iter()
            .enumerate()
            .filter(|(i, _)| pending_deps[*i].is_empty())
            .map(|(i, u)| (u.first(), i))
            .collect();

        let mut order = Vec::with_capacity(units.len());
        while let Some(next) = ready.pop_first() {
            let (_, i) = next;
            order.push(i);
            for &dependent in &dependents[i] {
                pending_deps[dependent].remove(&i);
                if pending_deps[dependent].is_empty() {
                    ready.insert((units[dependent].first(), dependent));
                }
            }
        }

        order.into_iter().map(|i| units[i].clone()).collect()
    }

    /// Force `prefix` tables to the front, then the dependency order of the
    /// rest. The prefix is advisory and not checked against the graph.
    pub fn resolve_with_prefix(&self, prefix: &[String]) -> Vec<SyncUnit> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut units: Vec<SyncUnit> = Vec::new();

        for table in prefix {
            if self.graph.contains(table) && seen.insert(table.as_str()) {
                units.push(SyncUnit::Ordered(table.clone()));
            }
        }

        for unit in self.resolve() {
            match unit {
                SyncUnit::Ordered(t) if !seen.contains(t.as_str()) => units.push(SyncUnit::Ordered(t)),
                SyncUnit::Ordered(_) => {}
                SyncUnit::CircularGroup(members) => {
                    let rest: Vec<String> = members
                        .into_iter()
                        .filter(|m| !seen.contains(m.as_str()))
                        .collect();
                    match rest.len() {
                        0 => {}
                        1 => units.extend(rest.into_iter().map(SyncUnit::Ordered)),
                        _ => units.push(SyncUnit::CircularGroup(rest)),
                    }
                }
            }
        }

        units
    }

    /// Tarjan's algorithm: depth-first search with an on-stack check to spot
    /// back edges. Components come out dependencies-first.
    fn strongly_connected_components(&self) -> Vec<Vec<&'a str>> {
        struct State<'g> {
            index: usize,
            indices: HashMap<&'g str, usize>,
            lowlink: HashMap<&'g str, usize>,
            stack: Vec<&'g str>,
            on_stack: HashSet<&'g str>,
            components: Vec<Vec<&'g str>>,
        }

        fn visit<'g>(graph: &'g DependencyGraph, node: &'g str, state: &mut State<'g>) {
            state.indices.insert(node, state.index);
            state.lowlink.insert(node, state.index);
            state.index += 1;
            state.stack.push(node);
            state.on_stack.insert(node);

            for dep in graph.dependencies(node) {
                if !state.indices.contains_key(dep) {
                    visit(graph, dep, state);
                    let low = state.lowlink[node].min(state.lowlink[dep]);
                    state.lowlink.insert(node, low);
                } else if state.on_stack.contains(dep) {
                    // back edge: dep is part of the current cycle
                    let low = state.lowlink[node].min(state.indices[dep]);
                    state.lowlink.insert(node, low);
                }
            }

            if state.lowlink[node] == state.indices[node] {
                let mut component = Vec::new();
                while let Some(member) = state.stack.pop() {
                    state.on_stack.remove(member);
                    component.push(member);
                    if member == node {
                        break;
                    }
                }
                state.components.push(component);
            }
        }

        let mut state = State {
            index: 0,
            indices: HashMap::new(),
            lowlink: HashMap::new(),
            stack: Vec::new(),
            on_stack: HashSet::new(),
            components: Vec::new(),
        };

        for node in self.graph.nodes() {
            if !state.indices.contains_key(node) {
                visit(self.graph, node, &mut state);
            }
        }

        state.components
    }
}
