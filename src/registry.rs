//! View declarations
//!
//! A [`ViewRegistry`] is built once per command: every [`ViewDefinition`]
//! is appended with an explicit [`ViewRegistry::register`] call and never
//! changes afterwards.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ViewGraphError, ViewGraphResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewKind {
    Plain,
    Materialized,
}

/// Rendered SQL of a view, as produced by the query builder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewBody {
    /// A SELECT; the orchestrator wraps it in CREATE [MATERIALIZED] VIEW
    Select(String),
    /// A complete statement executed verbatim (plain views only)
    Statement(String),
}

impl ViewBody {
    pub fn sql(&self) -> &str {
        match self {
            Self::Select(sql) | Self::Statement(sql) => sql,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    /// Qualified model label of the view itself, e.g. `app.Report`
    pub label: String,
    /// Relation name in the database
    pub name: String,
    pub body: ViewBody,
    /// Declared dependency labels, in declaration order, without duplicates
    pub dependencies: Vec<String>,
    pub kind: ViewKind,
    pub refresh_automatically: bool,
    /// Groups of field names backed by a unique index
    pub unique_columns: Vec<Vec<String>>,
}

impl ViewDefinition {
    pub fn view(label: impl Into<String>, name: impl Into<String>, select: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            name: name.into(),
            body: ViewBody::Select(select.into()),
            dependencies: Vec::new(),
            kind: ViewKind::Plain,
            refresh_automatically: true,
            unique_columns: Vec::new(),
        }
    }

    pub fn materialized(label: impl Into<String>, name: impl Into<String>, select: impl Into<String>) -> Self {
        Self {
            kind: ViewKind::Materialized,
            ..Self::view(label, name, select)
        }
    }

    /// Plain view whose statement is executed as written
    pub fn statement(label: impl Into<String>, name: impl Into<String>, statement: impl Into<String>) -> Self {
        Self {
            body: ViewBody::Statement(statement.into()),
            ..Self::view(label, name, String::new())
        }
    }

    pub fn depends_on<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for label in labels {
            let label = label.into();
            if !self.dependencies.contains(&label) {
                self.dependencies.push(label);
            }
        }
        self
    }

    pub fn refresh_manually(mut self) -> Self {
        self.refresh_automatically = false;
        self
    }

    pub fn unique<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_columns.push(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_materialized(&self) -> bool {
        self.kind == ViewKind::Materialized
    }

    /// Concurrent refresh needs at least one unique index
    pub fn refreshes_concurrently(&self) -> bool {
        self.is_materialized() && !self.unique_columns.is_empty()
    }

    /// Materialized view taking part in trigger-driven refresh
    pub fn is_auto_refreshed(&self) -> bool {
        self.is_materialized() && self.refresh_automatically
    }
}

#[derive(Debug, Clone, Default)]
pub struct ViewRegistry {
    views: Vec<ViewDefinition>,
    by_name: HashMap<String, usize>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a definition; names and labels must be unique
    pub fn register(&mut self, definition: ViewDefinition) -> ViewGraphResult<()> {
        if self.by_name.contains_key(&definition.name) {
            return Err(ViewGraphError::DuplicateView { name: definition.name });
        }
        if self.views.iter().any(|v| v.label.eq_ignore_ascii_case(&definition.label)) {
            return Err(ViewGraphError::DuplicateView { name: definition.label });
        }
        self.by_name.insert(definition.name.clone(), self.views.len());
        self.views.push(definition);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ViewDefinition> {
        self.by_name.get(name).map(|&idx| &self.views[idx])
    }

    /// Definitions in registration order
    pub fn iter(&self) -> impl Iterator<Item = &ViewDefinition> {
        self.views.iter()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depends_on_deduplicates_in_order() {
        let view = ViewDefinition::view("app.Report", "v_report", "SELECT 1")
            .depends_on(["app.Order", "app_customer", "app.Order"]);
        assert_eq!(view.dependencies, vec!["app.Order", "app_customer"]);
    }

    #[test]
    fn test_concurrent_refresh_requires_unique_group() {
        let plain = ViewDefinition::materialized("app.Totals", "mv_totals", "SELECT 1");
        assert!(!plain.refreshes_concurrently());
        assert!(plain.is_auto_refreshed());

        let unique = plain.clone().unique(["order_id"]);
        assert!(unique.refreshes_concurrently());

        let view = ViewDefinition::view("app.V", "v", "SELECT 1").unique(["id"]);
        assert!(!view.refreshes_concurrently());
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = ViewRegistry::new();
        registry.register(ViewDefinition::view("app.A", "v_a", "SELECT 1")).unwrap();

        let err = registry.register(ViewDefinition::view("app.B", "v_a", "SELECT 1")).unwrap_err();
        assert_eq!(err, ViewGraphError::DuplicateView { name: "v_a".to_string() });

        let err = registry.register(ViewDefinition::view("app.a", "v_other", "SELECT 1")).unwrap_err();
        assert!(matches!(err, ViewGraphError::DuplicateView { .. }));

        assert_eq!(registry.len(), 1);
        assert!(registry.get("v_a").is_some());
    }
}
