use std::collections::BTreeMap;

use serde::Serialize;

use super::graph::{DependencyGraph, ViewNode};

/// Which materialized views to refresh when a base table changes.
///
/// Lists follow the graph's topological order, so a materialized view that
/// reads another one is always refreshed after it. Tables iterate in name
/// order, which keeps generated trigger DDL stable between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RefreshPlan {
    triggers: BTreeMap<String, Vec<String>>,
}

impl RefreshPlan {
    /// Only automatically refreshed materialized views take part
    pub fn build(graph: &DependencyGraph) -> Self {
        let mut triggers: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for node in graph.topological_order().filter(|n| n.definition.is_auto_refreshed()) {
            for table in &node.from_tables {
                let views = triggers.entry(table.clone()).or_default();
                if !views.iter().any(|v| v == node.name()) {
                    views.push(node.name().to_string());
                }
            }
        }

        Self { triggers }
    }

    /// Ordered refresh list for a base table; empty when nothing depends on it
    pub fn views_for(&self, table: &str) -> &[String] {
        self.triggers.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.triggers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.triggers.iter().map(|(t, v)| (t.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}

/// Every materialized view, manual ones included, dependencies first
pub fn initial_refresh_order(graph: &DependencyGraph) -> Vec<&ViewNode> {
    graph
        .topological_order()
        .filter(|n| n.definition.is_materialized())
        .collect()
}
