use std::collections::{BTreeSet, HashMap, HashSet};

use crate::catalog::TableCatalog;
use crate::config::MAX_DEPENDENCY_DEPTH;
use crate::error::{ViewGraphError, ViewGraphResult};
use crate::registry::{ViewBody, ViewDefinition, ViewRegistry};

use super::resolver::{Resolved, Resolver};

/// A registered view with its dependencies resolved once at build time
#[derive(Debug, Clone)]
pub struct ViewNode {
    pub definition: ViewDefinition,
    /// Base tables named directly by the declaration
    pub direct_tables: Vec<String>,
    /// Views named directly by the declaration
    pub direct_views: Vec<String>,
    /// Every base table this view ultimately reads
    pub from_tables: BTreeSet<String>,
    /// Closest materialized views reachable through plain views only
    pub materialized_deps: Vec<String>,
    /// Length of the longest view-on-view chain below this view
    pub depth: usize,
}

impl ViewNode {
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// Dependency DAG over registered views and the base tables they read.
///
/// Example:
/// - `v_active_orders` reads `app_order`
/// - `mv_order_totals` reads `v_active_orders`
/// - `mv_customer_totals` reads `mv_order_totals`, `app_customer`
///
/// Topological order: ["v_active_orders", "mv_order_totals", "mv_customer_totals"]
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<ViewNode>,
    index: HashMap<String, usize>,
    /// Node indices, every view after all views it reads
    topo_order: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    New,
    Active,
    Done,
}

impl DependencyGraph {
    /// Resolve every declaration and check the configuration.
    ///
    /// # Errors
    /// Unresolvable labels, cycles, over-deep chains, manual-refresh
    /// materialized views read by automatic ones, and statement bodies on
    /// materialized views are all rejected here, before any DDL runs.
    pub fn build(registry: &ViewRegistry, catalog: &TableCatalog) -> ViewGraphResult<Self> {
        let resolver = Resolver::new(registry, catalog);
        let mut nodes = Vec::with_capacity(registry.len());

        for definition in registry.iter() {
            if definition.is_materialized() && matches!(definition.body, ViewBody::Statement(_)) {
                return Err(ViewGraphError::InvalidDefinition {
                    view: definition.name.clone(),
                    reason: "materialized views must be defined by a SELECT".to_string(),
                });
            }

            let mut direct_tables = Vec::new();
            let mut direct_views = Vec::new();
            for label in &definition.dependencies {
                match resolver.resolve(&definition.name, label)? {
                    Resolved::Table(table) => {
                        if !direct_tables.contains(&table) {
                            direct_tables.push(table);
                        }
                    }
                    Resolved::View(view) => {
                        if !direct_views.contains(&view.name) {
                            direct_views.push(view.name.clone());
                        }
                    }
                }
            }

            nodes.push(ViewNode {
                definition: definition.clone(),
                direct_tables,
                direct_views,
                from_tables: BTreeSet::new(),
                materialized_deps: Vec::new(),
                depth: 0,
            });
        }

        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.definition.name.clone(), i))
            .collect();

        let topo_order = topological_order(&nodes, &index)?;

        for &i in &topo_order {
            let mut tables: BTreeSet<String> = nodes[i].direct_tables.iter().cloned().collect();
            let mut depth = 0;
            for dep in &nodes[i].direct_views {
                let j = index[dep];
                tables.extend(nodes[j].from_tables.iter().cloned());
                depth = depth.max(nodes[j].depth + 1);
            }
            if depth > MAX_DEPENDENCY_DEPTH {
                return Err(ViewGraphError::DependencyDepthExceeded {
                    view: nodes[i].definition.name.clone(),
                    max_depth: MAX_DEPENDENCY_DEPTH,
                });
            }
            nodes[i].from_tables = tables;
            nodes[i].depth = depth;
        }

        let materialized_deps: Vec<Vec<String>> = (0..nodes.len())
            .map(|i| nearest_materialized(&nodes, &index, i))
            .collect();
        for (node, deps) in nodes.iter_mut().zip(materialized_deps) {
            node.materialized_deps = deps;
        }

        let graph = Self { nodes, index, topo_order };
        graph.check_refresh_modes()?;
        Ok(graph)
    }

    /// Automatic refresh cannot skip a manually refreshed upstream view
    fn check_refresh_modes(&self) -> ViewGraphResult<()> {
        for node in self.nodes.iter().filter(|n| n.definition.is_auto_refreshed()) {
            for dep in &node.materialized_deps {
                if let Some(upstream) = self.node(dep) {
                    if !upstream.definition.refresh_automatically {
                        return Err(ViewGraphError::ManualRefreshDependency {
                            view: node.definition.name.clone(),
                            dependency: dep.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&ViewNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Nodes in registration order
    pub fn nodes(&self) -> &[ViewNode] {
        &self.nodes
    }

    /// Nodes ordered so that every view follows the views it reads
    pub fn topological_order(&self) -> impl Iterator<Item = &ViewNode> {
        self.topo_order.iter().map(|&i| &self.nodes[i])
    }

    /// Views reading directly from `source` (a base table or a view name)
    pub fn dependents(&self, source: &str) -> Vec<&ViewNode> {
        self.nodes
            .iter()
            .filter(|n| {
                n.direct_tables.iter().any(|t| t == source) || n.direct_views.iter().any(|v| v == source)
            })
            .collect()
    }

    /// Every base table read by at least one registered view
    pub fn base_tables(&self) -> BTreeSet<&str> {
        self.nodes
            .iter()
            .flat_map(|n| n.from_tables.iter().map(String::as_str))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Depth-first post-order over view-on-view edges with an explicit stack.
/// Roots are visited in registration order, dependencies in declaration order.
fn topological_order(nodes: &[ViewNode], index: &HashMap<String, usize>) -> ViewGraphResult<Vec<usize>> {
    let mut marks = vec![Mark::New; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());

    for root in 0..nodes.len() {
        if marks[root] != Mark::New {
            continue;
        }
        marks[root] = Mark::Active;
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];

        while let Some(&(node, child)) = stack.last() {
            match nodes[node].direct_views.get(child) {
                Some(dep) => {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    let j = index[dep];
                    match marks[j] {
                        Mark::New => {
                            marks[j] = Mark::Active;
                            stack.push((j, 0));
                        }
                        Mark::Active => {
                            let start = stack.iter().position(|&(n, _)| n == j).unwrap_or(0);
                            let mut cycle: Vec<String> = stack[start..]
                                .iter()
                                .map(|&(n, _)| nodes[n].definition.name.clone())
                                .collect();
                            cycle.push(nodes[j].definition.name.clone());
                            return Err(ViewGraphError::CircularDependency { cycle });
                        }
                        Mark::Done => {}
                    }
                }
                None => {
                    marks[node] = Mark::Done;
                    order.push(node);
                    stack.pop();
                }
            }
        }
    }

    Ok(order)
}

fn nearest_materialized(nodes: &[ViewNode], index: &HashMap<String, usize>, start: usize) -> Vec<String> {
    let mut found = Vec::new();
    let mut seen = HashSet::new();
    let mut stack: Vec<usize> = nodes[start].direct_views.iter().rev().map(|v| index[v]).collect();

    while let Some(j) = stack.pop() {
        if !seen.insert(j) {
            continue;
        }
        let node = &nodes[j];
        if node.definition.is_materialized() {
            found.push(node.definition.name.clone());
        } else {
            stack.extend(node.direct_views.iter().rev().map(|v| index[v]));
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelEntry;
    use crate::error::testing::{assert_error_contains, assert_error_sqlstate};

    fn catalog() -> TableCatalog {
        TableCatalog::new()
            .with(ModelEntry::new("app.Order", "app_order"))
            .with(ModelEntry::new("app.Customer", "app_customer"))
            .with(ModelEntry::new("app.Product", "app_product"))
    }

    fn position(graph: &DependencyGraph, name: &str) -> usize {
        graph.topological_order().position(|n| n.name() == name).unwrap()
    }

    #[test]
    fn test_transitive_base_tables() {
        let mut registry = ViewRegistry::new();
        registry
            .register(ViewDefinition::view("app.Active", "v_active", "SELECT * FROM app_order").depends_on(["app.Order"]))
            .unwrap();
        registry
            .register(
                ViewDefinition::materialized("app.Report", "mv_report", "SELECT 1")
                    .depends_on(["app.Active", "app_customer"]),
            )
            .unwrap();

        let graph = DependencyGraph::build(&registry, &catalog()).unwrap();
        let report = graph.node("mv_report").unwrap();

        assert_eq!(report.direct_tables, vec!["app_customer"]);
        assert_eq!(report.direct_views, vec!["v_active"]);
        let tables: Vec<&str> = report.from_tables.iter().map(String::as_str).collect();
        assert_eq!(tables, vec!["app_customer", "app_order"]);
        assert_eq!(report.depth, 1);
        assert_eq!(graph.base_tables().len(), 2);
    }

    #[test]
    fn test_topological_order_with_diamond() {
        // v_top -> (v_left, v_right) -> v_base
        let mut registry = ViewRegistry::new();
        registry
            .register(ViewDefinition::view("app.Top", "v_top", "SELECT 1").depends_on(["app.Left", "app.Right"]))
            .unwrap();
        registry
            .register(ViewDefinition::view("app.Left", "v_left", "SELECT 1").depends_on(["app.Base"]))
            .unwrap();
        registry
            .register(ViewDefinition::view("app.Right", "v_right", "SELECT 1").depends_on(["app.Base"]))
            .unwrap();
        registry
            .register(ViewDefinition::view("app.Base", "v_base", "SELECT 1").depends_on(["app.Order"]))
            .unwrap();

        let graph = DependencyGraph::build(&registry, &catalog()).unwrap();
        let order: Vec<&str> = graph.topological_order().map(ViewNode::name).collect();

        assert_eq!(order.len(), 4);
        assert!(position(&graph, "v_base") < position(&graph, "v_left"));
        assert!(position(&graph, "v_base") < position(&graph, "v_right"));
        assert!(position(&graph, "v_left") < position(&graph, "v_top"));
        assert!(position(&graph, "v_right") < position(&graph, "v_top"));
        assert_eq!(graph.node("v_top").unwrap().depth, 2);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut registry = ViewRegistry::new();
        registry
            .register(ViewDefinition::view("app.A", "v_a", "SELECT 1").depends_on(["app.B"]))
            .unwrap();
        registry
            .register(ViewDefinition::view("app.B", "v_b", "SELECT 1").depends_on(["v_c"]))
            .unwrap();
        registry
            .register(ViewDefinition::view("app.C", "v_c", "SELECT 1").depends_on(["app.A"]))
            .unwrap();

        let err = DependencyGraph::build(&registry, &catalog()).unwrap_err();
        assert_eq!(
            err,
            ViewGraphError::CircularDependency {
                cycle: vec!["v_a".into(), "v_b".into(), "v_c".into(), "v_a".into()],
            }
        );
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut registry = ViewRegistry::new();
        registry
            .register(ViewDefinition::view("app.A", "v_a", "SELECT 1").depends_on(["v_a"]))
            .unwrap();
        assert_error_sqlstate(DependencyGraph::build(&registry, &catalog()), "55P03");
    }

    #[test]
    fn test_chain_deeper_than_limit_is_rejected() {
        let mut registry = ViewRegistry::new();
        registry
            .register(ViewDefinition::view("app.V0", "v_0", "SELECT 1").depends_on(["app.Order"]))
            .unwrap();
        for i in 1..=MAX_DEPENDENCY_DEPTH + 1 {
            registry
                .register(
                    ViewDefinition::view(format!("app.V{i}"), format!("v_{i}"), "SELECT 1")
                        .depends_on([format!("v_{}", i - 1)]),
                )
                .unwrap();
        }

        let result = DependencyGraph::build(&registry, &catalog());
        assert_error_sqlstate(result.clone(), "54001");
        assert_eq!(
            result.unwrap_err(),
            ViewGraphError::DependencyDepthExceeded {
                view: format!("v_{}", MAX_DEPENDENCY_DEPTH + 1),
                max_depth: MAX_DEPENDENCY_DEPTH,
            }
        );
    }

    #[test]
    fn test_chain_at_limit_builds() {
        let mut registry = ViewRegistry::new();
        registry
            .register(ViewDefinition::view("app.V0", "v_0", "SELECT 1").depends_on(["app.Order"]))
            .unwrap();
        for i in 1..=MAX_DEPENDENCY_DEPTH {
            registry
                .register(
                    ViewDefinition::view(format!("app.V{i}"), format!("v_{i}"), "SELECT 1")
                        .depends_on([format!("v_{}", i - 1)]),
                )
                .unwrap();
        }

        let graph = DependencyGraph::build(&registry, &catalog()).unwrap();
        assert_eq!(graph.node(&format!("v_{MAX_DEPENDENCY_DEPTH}")).unwrap().depth, MAX_DEPENDENCY_DEPTH);
    }

    #[test]
    fn test_unresolvable_label() {
        let mut registry = ViewRegistry::new();
        registry
            .register(ViewDefinition::view("app.A", "v_a", "SELECT 1").depends_on(["app.Nope"]))
            .unwrap();
        assert_error_contains(DependencyGraph::build(&registry, &catalog()), "app.Nope");
    }

    #[test]
    fn test_manual_upstream_of_automatic_view_is_rejected() {
        let mut registry = ViewRegistry::new();
        registry
            .register(
                ViewDefinition::materialized("app.Daily", "mv_daily", "SELECT 1")
                    .depends_on(["app.Order"])
                    .refresh_manually(),
            )
            .unwrap();
        // reached through a plain view
        registry
            .register(ViewDefinition::view("app.Recent", "v_recent", "SELECT 1").depends_on(["mv_daily"]))
            .unwrap();
        registry
            .register(ViewDefinition::materialized("app.Weekly", "mv_weekly", "SELECT 1").depends_on(["app.Recent"]))
            .unwrap();

        let err = DependencyGraph::build(&registry, &catalog()).unwrap_err();
        assert_eq!(
            err,
            ViewGraphError::ManualRefreshDependency {
                view: "mv_weekly".to_string(),
                dependency: "mv_daily".to_string(),
            }
        );
    }

    #[test]
    fn test_manual_view_reading_manual_view_is_allowed() {
        let mut registry = ViewRegistry::new();
        registry
            .register(
                ViewDefinition::materialized("app.Daily", "mv_daily", "SELECT 1")
                    .depends_on(["app.Order"])
                    .refresh_manually(),
            )
            .unwrap();
        registry
            .register(
                ViewDefinition::materialized("app.Weekly", "mv_weekly", "SELECT 1")
                    .depends_on(["app.Daily"])
                    .refresh_manually(),
            )
            .unwrap();

        let graph = DependencyGraph::build(&registry, &catalog()).unwrap();
        assert_eq!(graph.node("mv_weekly").unwrap().materialized_deps, vec!["mv_daily"]);
    }

    #[test]
    fn test_materialized_statement_body_is_rejected() {
        let mut registry = ViewRegistry::new();
        let mut definition = ViewDefinition::materialized("app.M", "mv_m", "SELECT 1");
        definition.body = ViewBody::Statement("CREATE MATERIALIZED VIEW mv_m AS SELECT 1".to_string());
        registry.register(definition).unwrap();

        assert_error_sqlstate(DependencyGraph::build(&registry, &catalog()), "42601");
    }

    #[test]
    fn test_dependents() {
        let mut registry = ViewRegistry::new();
        registry
            .register(ViewDefinition::view("app.A", "v_a", "SELECT 1").depends_on(["app.Order"]))
            .unwrap();
        registry
            .register(ViewDefinition::view("app.B", "v_b", "SELECT 1").depends_on(["app.A", "app.Order"]))
            .unwrap();

        let graph = DependencyGraph::build(&registry, &catalog()).unwrap();
        let readers: Vec<&str> = graph.dependents("app_order").into_iter().map(ViewNode::name).collect();
        assert_eq!(readers, vec!["v_a", "v_b"]);
        let readers: Vec<&str> = graph.dependents("v_a").into_iter().map(ViewNode::name).collect();
        assert_eq!(readers, vec!["v_b"]);
    }
}
