use crate::catalog::TableCatalog;
use crate::error::{ViewGraphError, ViewGraphResult};
use crate::registry::{ViewDefinition, ViewRegistry};

/// What a dependency label points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved<'a> {
    Table(String),
    View(&'a ViewDefinition),
}

/// Maps dependency labels to base tables or registered views.
///
/// - `app.Model` goes through the model catalog; the model's table is a view
///   when a view is registered under that name.
/// - A bare name is a relation name: registered view first, then catalog
///   table.
pub struct Resolver<'a> {
    registry: &'a ViewRegistry,
    catalog: &'a TableCatalog,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a ViewRegistry, catalog: &'a TableCatalog) -> Self {
        Self { registry, catalog }
    }

    pub fn resolve(&self, view: &str, label: &str) -> ViewGraphResult<Resolved<'a>> {
        let table = if label.contains('.') {
            self.catalog
                .by_label(label)
                .map(|entry| entry.db_table.as_str())
                .or_else(|| {
                    // views are models too, even when the catalog lacks them
                    self.registry
                        .iter()
                        .find(|v| v.label.eq_ignore_ascii_case(label))
                        .map(|v| v.name.as_str())
                })
        } else if self.registry.get(label).is_some() || self.catalog.by_table(label).is_some() {
            Some(label)
        } else {
            None
        };

        let table = table.ok_or_else(|| ViewGraphError::UnresolvableDependency {
            view: view.to_string(),
            label: label.to_string(),
        })?;

        Ok(match self.registry.get(table) {
            Some(definition) => Resolved::View(definition),
            None => Resolved::Table(table.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelEntry;

    fn fixture() -> (ViewRegistry, TableCatalog) {
        let mut registry = ViewRegistry::new();
        registry
            .register(ViewDefinition::view("app.Active", "v_active", "SELECT * FROM app_order"))
            .unwrap();
        registry
            .register(ViewDefinition::materialized("app.Totals", "mv_totals", "SELECT 1"))
            .unwrap();
        let catalog = TableCatalog::new()
            .with(ModelEntry::new("app.Order", "app_order"))
            .with(ModelEntry::new("app.Active", "v_active"));
        (registry, catalog)
    }

    #[test]
    fn test_qualified_label_to_table() {
        let (registry, catalog) = fixture();
        let resolver = Resolver::new(&registry, &catalog);
        assert_eq!(
            resolver.resolve("v", "app.Order").unwrap(),
            Resolved::Table("app_order".to_string())
        );
        assert_eq!(
            resolver.resolve("v", "app.order").unwrap(),
            Resolved::Table("app_order".to_string())
        );
    }

    #[test]
    fn test_qualified_label_to_view() {
        let (registry, catalog) = fixture();
        let resolver = Resolver::new(&registry, &catalog);

        match resolver.resolve("v", "app.Active").unwrap() {
            Resolved::View(def) => assert_eq!(def.name, "v_active"),
            other => panic!("expected view, got {other:?}"),
        }
        // not in the catalog, found through the registry label
        match resolver.resolve("v", "app.Totals").unwrap() {
            Resolved::View(def) => assert_eq!(def.name, "mv_totals"),
            other => panic!("expected view, got {other:?}"),
        }
    }

    #[test]
    fn test_bare_label() {
        let (registry, catalog) = fixture();
        let resolver = Resolver::new(&registry, &catalog);

        assert_eq!(
            resolver.resolve("v", "app_order").unwrap(),
            Resolved::Table("app_order".to_string())
        );
        assert!(matches!(resolver.resolve("v", "mv_totals").unwrap(), Resolved::View(_)));
    }

    #[test]
    fn test_unknown_label_is_fatal() {
        let (registry, catalog) = fixture();
        let resolver = Resolver::new(&registry, &catalog);

        let err = resolver.resolve("v_report", "app.Missing").unwrap_err();
        assert_eq!(
            err,
            ViewGraphError::UnresolvableDependency {
                view: "v_report".to_string(),
                label: "app.Missing".to_string(),
            }
        );
        assert!(resolver.resolve("v_report", "no_such_table").is_err());
    }
}
