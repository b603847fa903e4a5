use std::collections::HashSet;

use serde::Serialize;

use crate::catalog::{quote_name, TableCatalog};
use crate::config::MAX_IDENTIFIER_LEN;
use crate::dependency::graph::{DependencyGraph, ViewNode};
use crate::dependency::scheduler::{initial_refresh_order, RefreshPlan};
use crate::dependency::triggers::{install_statements, name_hash, refresh_statement};
use crate::error::ViewGraphResult;
use crate::registry::{ViewBody, ViewKind, ViewRegistry};
use crate::session::{run, NoticeLevel, Session};
use crate::validation::{validate_dependencies, ValidationWarning};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateOptions {
    /// Drop every registered view before creating
    pub force: bool,
    /// Check the configuration and dependencies, execute nothing
    pub validate_only: bool,
    /// Run the dependency validator before creating
    pub validate: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            force: false,
            validate_only: false,
            validate: true,
        }
    }
}

/// What one `create_views` run did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateReport {
    pub warnings: Vec<ValidationWarning>,
    pub dropped: Vec<String>,
    pub created: Vec<String>,
    pub refreshed: Vec<String>,
    pub trigger_tables: Vec<String>,
    /// Base tables no automatic view reads any more; their triggers were removed
    pub untriggered_tables: Vec<String>,
}

/// Create all registered views, refresh materialized views and install
/// refresh triggers.
///
/// Steps:
/// 1. Build the dependency graph (configuration errors stop here)
/// 2. Validate declared dependencies (warnings only)
/// 3. Stop if `validate_only`
/// 4. Drop every registered view if `force`
/// 5. Create views, dependencies first, each exactly once
/// 6. Refresh every materialized view
/// 7. Remove refresh triggers from base tables that left the plan
/// 8. Install deferred refresh triggers on every base table in the plan
pub fn create_views<S: Session + ?Sized>(
    session: &mut S,
    registry: &ViewRegistry,
    catalog: &TableCatalog,
    options: CreateOptions,
) -> ViewGraphResult<CreateReport> {
    let graph = DependencyGraph::build(registry, catalog)?;
    let plan = RefreshPlan::build(&graph);
    let mut report = CreateReport::default();

    if options.validate || options.validate_only {
        report.warnings = validate_dependencies(registry, catalog)?;
        for warning in &report.warnings {
            session.notice(NoticeLevel::Warning, &warning.to_string());
        }
    }

    if options.validate_only {
        return Ok(report);
    }

    if options.force {
        report.dropped = super::drop::drop_all(session, registry)?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
    }

    report.created = create_all(session, &graph, catalog)?;

    for node in initial_refresh_order(&graph) {
        let definition = &node.definition;
        run(session, &refresh_statement(&definition.name, definition.refreshes_concurrently()))?;
        report.refreshed.push(definition.name.clone());
    }

    let planned: HashSet<&str> = plan.tables().collect();
    let unplanned = graph.base_tables().into_iter().filter(|t| !planned.contains(t));
    report.untriggered_tables = super::drop::remove_refresh_triggers(session, unplanned)?;
    report.trigger_tables = install_refresh_triggers(session, &graph, &plan)?;

    session.notice(
        NoticeLevel::Info,
        &format!(
            "pg_viewgraph: created {} views, refreshed {} materialized views, installed refresh triggers on {} tables",
            report.created.len(),
            report.refreshed.len(),
            report.trigger_tables.len()
        ),
    );

    Ok(report)
}

/// Create every view after the views it reads, each at most once.
///
/// Depth-first with an explicit stack: a node is first pushed unexpanded,
/// then re-pushed expanded above its dependencies; popping the expanded
/// entry emits its DDL. Views already in the created set are skipped, which
/// handles diamond dependencies.
pub fn create_all<S: Session + ?Sized>(
    session: &mut S,
    graph: &DependencyGraph,
    catalog: &TableCatalog,
) -> ViewGraphResult<Vec<String>> {
    let mut created: HashSet<String> = HashSet::new();
    let mut order = Vec::with_capacity(graph.len());

    for root in graph.nodes() {
        let mut stack: Vec<(&ViewNode, bool)> = vec![(root, false)];

        while let Some((node, expanded)) = stack.pop() {
            if created.contains(node.name()) {
                continue;
            }

            if expanded {
                for sql in creation_statements(node, catalog) {
                    run(session, &sql)?;
                }
                session.notice(NoticeLevel::Info, &format!("Created view {}", node.name()));
                created.insert(node.name().to_string());
                order.push(node.name().to_string());
                continue;
            }

            stack.push((node, true));
            for dep in node.direct_views.iter().rev() {
                if created.contains(dep) {
                    continue;
                }
                if let Some(dep_node) = graph.node(dep) {
                    stack.push((dep_node, false));
                }
            }
        }
    }

    Ok(order)
}

/// DDL creating one view and, for materialized views, its unique indexes
pub fn creation_statements(node: &ViewNode, catalog: &TableCatalog) -> Vec<String> {
    let definition = &node.definition;
    let name = quote_name(&definition.name);

    match (&definition.kind, &definition.body) {
        (ViewKind::Plain, ViewBody::Statement(sql)) => vec![sql.clone()],
        (ViewKind::Plain, ViewBody::Select(sql)) => {
            vec![format!("CREATE OR REPLACE VIEW {name} AS {sql}")]
        }
        (ViewKind::Materialized, body) => {
            let mut statements = vec![format!("CREATE MATERIALIZED VIEW {name} AS {}", body.sql())];

            let entry = catalog.by_table(&definition.name);
            for group in &definition.unique_columns {
                let columns: Vec<&str> = group
                    .iter()
                    .map(|field| entry.map_or(field.as_str(), |e| e.column_for(field)))
                    .collect();
                statements.push(format!(
                    "CREATE UNIQUE INDEX {} ON {name} ({})",
                    quote_name(&unique_index_name(&definition.name, &columns)),
                    columns.iter().map(|c| quote_name(c)).collect::<Vec<_>>().join(", ")
                ));
            }
            statements
        }
    }
}

/// `<view>_<columns>_<hash>_uniq`, shortened to fit an identifier
pub fn unique_index_name(view: &str, columns: &[&str]) -> String {
    let hash = name_hash(&format!("{}({})", view, columns.join(",")));
    let suffix = format!("_{hash}_uniq");
    let base: String = format!("{}_{}", view, columns.join("_"))
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .take(MAX_IDENTIFIER_LEN - suffix.len())
        .collect();
    format!("{base}{suffix}")
}

/// Install deferred refresh triggers for every planned base table
pub fn install_refresh_triggers<S: Session + ?Sized>(
    session: &mut S,
    graph: &DependencyGraph,
    plan: &RefreshPlan,
) -> ViewGraphResult<Vec<String>> {
    let mut tables = Vec::with_capacity(plan.len());

    for (table, views) in plan.iter() {
        let definitions: Vec<_> = views
            .iter()
            .filter_map(|v| graph.node(v).map(|n| &n.definition))
            .collect();
        if definitions.is_empty() {
            continue;
        }

        for sql in install_statements(table, &definitions) {
            run(session, &sql)?;
        }
        session.notice(
            NoticeLevel::Info,
            &format!("Installed refresh trigger on {} for {}", table, views.join(", ")),
        );
        tables.push(table.to_string());
    }

    Ok(tables)
}
