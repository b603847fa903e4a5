use serde::Serialize;

use crate::catalog::{quote_name, TableCatalog};
use crate::dependency::graph::DependencyGraph;
use crate::dependency::triggers::teardown_statements;
use crate::error::ViewGraphResult;
use crate::internal_error;
use crate::registry::{ViewDefinition, ViewKind, ViewRegistry};
use crate::session::{NoticeLevel, RelationKind, Session, SqlErrorKind};

/// One dropped view and the relation kind that was actually dropped
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedView {
    pub name: String,
    pub kind: RelationKind,
}

/// What one `drop_views` run did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DropReport {
    pub dropped: Vec<DroppedView>,
    pub trigger_tables: Vec<String>,
}

/// Kinds to try, in order, when dropping a view declared as `kind`.
///
/// The relation in the database may have been created under an earlier
/// declaration, so every kind is tried before giving up.
pub const fn drop_chain(kind: ViewKind) -> [RelationKind; 3] {
    match kind {
        ViewKind::Materialized => [
            RelationKind::MaterializedView,
            RelationKind::View,
            RelationKind::Table,
        ],
        ViewKind::Plain => [
            RelationKind::View,
            RelationKind::MaterializedView,
            RelationKind::Table,
        ],
    }
}

/// Drop one view whatever kind of relation currently holds its name.
///
/// When the session can report the actual kind, mismatching attempts are
/// skipped. Otherwise `DROP <kind> IF EXISTS ... CASCADE` is attempted and a
/// wrong-object-type error moves on to the next kind. Any other error, or a
/// failure on the last kind, is fatal.
pub fn drop_view<S: Session + ?Sized>(
    session: &mut S,
    definition: &ViewDefinition,
) -> ViewGraphResult<RelationKind> {
    let chain = drop_chain(definition.kind);
    let actual = session
        .relation_kind(&definition.name)
        .map_err(|e| e.into_error(&definition.name))?;

    for (i, kind) in chain.iter().copied().enumerate() {
        let last = i + 1 == chain.len();

        if let Some(actual) = actual {
            if actual != kind && !last {
                continue;
            }
        }

        let sql = format!("DROP {} IF EXISTS {} CASCADE", kind.keyword(), quote_name(&definition.name));
        session.notice(NoticeLevel::Debug, &sql);

        match session.execute(&sql) {
            Ok(()) => return Ok(kind),
            Err(e) if e.kind == SqlErrorKind::WrongObjectType && !last => {
                session.notice(
                    NoticeLevel::Debug,
                    &format!("{} is not a {}, trying next kind", definition.name, kind.keyword()),
                );
            }
            Err(e) => return Err(e.into_error(&sql)),
        }
    }

    Err(internal_error!("drop chain for {} exhausted", definition.name))
}

/// Drop every registered view in registration order
pub fn drop_all<S: Session + ?Sized>(
    session: &mut S,
    registry: &ViewRegistry,
) -> ViewGraphResult<Vec<(String, RelationKind)>> {
    let mut dropped = Vec::with_capacity(registry.len());
    for definition in registry.iter() {
        let kind = drop_view(session, definition)?;
        dropped.push((definition.name.clone(), kind));
    }
    Ok(dropped)
}

/// Remove refresh triggers and their helper objects from `tables`.
///
/// A table that no longer exists is skipped. Returns the tables that were
/// cleared.
pub fn remove_refresh_triggers<'a, S, I>(session: &mut S, tables: I) -> ViewGraphResult<Vec<String>>
where
    S: Session + ?Sized,
    I: IntoIterator<Item = &'a str>,
{
    let mut cleared = Vec::new();

    'tables: for table in tables {
        for sql in teardown_statements(table) {
            session.notice(NoticeLevel::Debug, &sql);
            match session.execute(&sql) {
                Ok(()) => {}
                Err(e) if e.kind == SqlErrorKind::UndefinedObject => {
                    session.notice(
                        NoticeLevel::Debug,
                        &format!("Table {table} is gone, skipping trigger removal: {}", e.message),
                    );
                    continue 'tables;
                }
                Err(e) => return Err(e.into_error(&sql)),
            }
        }
        cleared.push(table.to_string());
    }

    Ok(cleared)
}

/// Drop every registered view, then remove refresh triggers from every
/// base table the registered views read.
///
/// Trigger teardown is best effort: a configuration that no longer builds
/// only produces a warning, and a base table that no longer exists is
/// skipped. Tables are covered even when no automatic view reads them any
/// more, so triggers left by an earlier configuration go too.
pub fn drop_views<S: Session + ?Sized>(
    session: &mut S,
    registry: &ViewRegistry,
    catalog: &TableCatalog,
) -> ViewGraphResult<DropReport> {
    let mut report = DropReport {
        dropped: drop_all(session, registry)?
            .into_iter()
            .map(|(name, kind)| DroppedView { name, kind })
            .collect(),
        trigger_tables: Vec::new(),
    };

    let graph = match DependencyGraph::build(registry, catalog) {
        Ok(graph) => graph,
        Err(e) => {
            session.notice(
                NoticeLevel::Warning,
                &format!("Skipping refresh trigger removal: {e}"),
            );
            return Ok(report);
        }
    };

    report.trigger_tables = remove_refresh_triggers(session, graph.base_tables())?;

    session.notice(
        NoticeLevel::Info,
        &format!(
            "pg_viewgraph: dropped {} views, removed refresh triggers from {} tables",
            report.dropped.len(),
            report.trigger_tables.len()
        ),
    );

    Ok(report)
}
