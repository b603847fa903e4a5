use std::collections::BTreeMap;

use pgrx::prelude::*;
use pgrx::JsonB;

use crate::catalog::{ModelEntry, TableCatalog};
use crate::config::{MODEL_TABLE, VIEW_TABLE};
use crate::error::{ViewGraphError, ViewGraphResult};
use crate::registry::{ViewBody, ViewDefinition, ViewKind, ViewRegistry};
use crate::validation::{validate_label, validate_sql_identifier};

// Registry tables created at CREATE EXTENSION
extension_sql!(
    r"
    CREATE TABLE IF NOT EXISTS public.pg_viewgraph_model (
        label TEXT NOT NULL PRIMARY KEY,
        db_table TEXT NOT NULL UNIQUE,
        fields JSONB NOT NULL DEFAULT '{}',
        seq BIGSERIAL NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE TABLE IF NOT EXISTS public.pg_viewgraph_view (
        name TEXT NOT NULL PRIMARY KEY,
        label TEXT NOT NULL UNIQUE,
        definition TEXT NOT NULL,
        is_statement BOOLEAN NOT NULL DEFAULT FALSE,
        dependencies TEXT[] NOT NULL DEFAULT '{}',
        materialized BOOLEAN NOT NULL DEFAULT FALSE,
        refresh_automatically BOOLEAN NOT NULL DEFAULT TRUE,
        unique_columns JSONB NOT NULL DEFAULT '[]',
        seq BIGSERIAL NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE TABLE IF NOT EXISTS public.pg_viewgraph_audit_log (
        id BIGSERIAL PRIMARY KEY,
        operation TEXT NOT NULL,
        performed_by TEXT NOT NULL,
        performed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        details JSONB NOT NULL DEFAULT '{}'
    );

    COMMENT ON TABLE public.pg_viewgraph_model IS 'Model labels and the tables that store them';
    COMMENT ON TABLE public.pg_viewgraph_view IS 'Registered views in registration order';
    COMMENT ON TABLE public.pg_viewgraph_audit_log IS 'pg_viewgraph create/drop runs';
    ",
    name = "create_metadata_tables",
);

pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn catalog_error(operation: &str) -> impl Fn(pgrx::spi::Error) -> ViewGraphError + '_ {
    move |e| ViewGraphError::CatalogError {
        operation: operation.to_string(),
        pg_error: e.to_string(),
    }
}

fn not_null<T>(value: Option<T>, column: &str) -> ViewGraphResult<T> {
    value.ok_or_else(|| ViewGraphError::CatalogError {
        operation: format!("Read {column}"),
        pg_error: "unexpected NULL".to_string(),
    })
}

/// Load registered views in registration order
pub fn load_registry() -> ViewGraphResult<ViewRegistry> {
    let query = format!(
        "SELECT label, name, definition, is_statement, dependencies, \
                materialized, refresh_automatically, unique_columns \
         FROM public.{VIEW_TABLE} ORDER BY seq"
    );

    let definitions = Spi::connect(|client| {
        let mut definitions = Vec::new();
        for row in client.select(&query, None, None)? {
            let label: String = not_null(row.get(1)?, "label")?;
            let name: String = not_null(row.get(2)?, "name")?;
            let sql: String = not_null(row.get(3)?, "definition")?;
            let is_statement: bool = row.get(4)?.unwrap_or(false);
            let dependencies: Vec<String> = row.get(5)?.unwrap_or_default();
            let materialized: bool = row.get(6)?.unwrap_or(false);
            let refresh_automatically: bool = row.get(7)?.unwrap_or(true);
            let unique_columns: Option<JsonB> = row.get(8)?;

            let unique_columns = match unique_columns {
                Some(JsonB(value)) => serde_json::from_value(value)?,
                None => Vec::new(),
            };

            definitions.push(ViewDefinition {
                label,
                name,
                body: if is_statement { ViewBody::Statement(sql) } else { ViewBody::Select(sql) },
                dependencies,
                kind: if materialized { ViewKind::Materialized } else { ViewKind::Plain },
                refresh_automatically,
                unique_columns,
            });
        }
        Ok::<_, ViewGraphError>(definitions)
    })?;

    let mut registry = ViewRegistry::new();
    for definition in definitions {
        registry.register(definition)?;
    }
    Ok(registry)
}

fn load_models() -> ViewGraphResult<Vec<ModelEntry>> {
    let query = format!("SELECT label, db_table, fields FROM public.{MODEL_TABLE} ORDER BY seq");

    Spi::connect(|client| {
        let mut models = Vec::new();
        for row in client.select(&query, None, None)? {
            let label: String = not_null(row.get(1)?, "label")?;
            let db_table: String = not_null(row.get(2)?, "db_table")?;
            let fields: BTreeMap<String, String> = match row.get::<JsonB>(3)? {
                Some(JsonB(value)) => serde_json::from_value(value)?,
                None => BTreeMap::new(),
            };
            models.push(ModelEntry { label, db_table, fields });
        }
        Ok(models)
    })
}

/// Ordinary tables in `public`, minus the extension's own bookkeeping
fn introspect_tables() -> ViewGraphResult<Vec<String>> {
    let query = r"SELECT c.relname::text
                  FROM pg_class c
                  JOIN pg_namespace n ON n.oid = c.relnamespace
                  WHERE n.nspname = 'public'
                    AND c.relkind IN ('r', 'p')
                    AND c.relname NOT LIKE 'pg\_viewgraph\_%'
                    AND c.relname NOT LIKE '%\_scheduled\_refresh\_%'
                  ORDER BY c.relname";

    Spi::connect(|client| {
        let mut tables = Vec::new();
        for row in client.select(query, None, None)? {
            if let Some(name) = row.get::<String>(1)? {
                tables.push(name);
            }
        }
        Ok::<_, pgrx::spi::Error>(tables)
    })
    .map_err(catalog_error("Introspect public tables"))
}

/// Build the table catalog.
///
/// Later sources override earlier ones for the same table: introspected
/// `public.<table>` entries, then the registered views themselves, then
/// explicitly registered models.
pub fn assemble_catalog(tables: Vec<String>, registry: &ViewRegistry, models: Vec<ModelEntry>) -> TableCatalog {
    let mut catalog = TableCatalog::new();
    for table in tables {
        catalog.insert(ModelEntry::new(format!("public.{table}"), table));
    }
    for view in registry.iter() {
        catalog.insert(ModelEntry::new(view.label.clone(), view.name.clone()));
    }
    for model in models {
        catalog.insert(model);
    }
    catalog
}

pub fn load_catalog(registry: &ViewRegistry) -> ViewGraphResult<TableCatalog> {
    Ok(assemble_catalog(introspect_tables()?, registry, load_models()?))
}

/// Insert or update a model label
pub fn register_model(label: &str, db_table: &str, fields: serde_json::Value) -> ViewGraphResult<()> {
    validate_label(label, "label")?;
    validate_sql_identifier(db_table, "db_table")?;

    let fields: BTreeMap<String, String> = serde_json::from_value(fields)?;
    for (field, column) in &fields {
        validate_sql_identifier(field, "field")?;
        validate_sql_identifier(column, "column")?;
    }

    let sql = format!(
        "INSERT INTO public.{MODEL_TABLE} (label, db_table, fields) VALUES ({}, {}, {}::jsonb) \
         ON CONFLICT (label) DO UPDATE SET db_table = EXCLUDED.db_table, fields = EXCLUDED.fields",
        quote_literal(label),
        quote_literal(db_table),
        quote_literal(&serde_json::to_string(&fields)?),
    );
    Spi::run(&sql).map_err(|e| ViewGraphError::SpiError {
        query: sql.clone(),
        error: e.to_string(),
    })
}

/// Arguments of `pg_viewgraph_register_view`
#[derive(Debug, Clone)]
pub struct ViewRegistration {
    pub label: String,
    pub name: String,
    pub definition: String,
    pub dependencies: Vec<String>,
    pub materialized: bool,
    pub refresh_automatically: bool,
    pub unique_columns: serde_json::Value,
    pub is_statement: bool,
}

/// Insert or update a view; re-registering keeps its original position
pub fn register_view(registration: ViewRegistration) -> ViewGraphResult<()> {
    validate_label(&registration.label, "label")?;
    validate_sql_identifier(&registration.name, "name")?;
    for dependency in &registration.dependencies {
        validate_label(dependency, "dependency")?;
    }

    let unique_columns: Vec<Vec<String>> = serde_json::from_value(registration.unique_columns)?;
    for field in unique_columns.iter().flatten() {
        validate_sql_identifier(field, "unique column")?;
    }

    if registration.definition.trim().is_empty() {
        return Err(ViewGraphError::InvalidDefinition {
            view: registration.name,
            reason: "definition is empty".to_string(),
        });
    }
    if registration.materialized && registration.is_statement {
        return Err(ViewGraphError::InvalidDefinition {
            view: registration.name,
            reason: "materialized views must be defined by a SELECT".to_string(),
        });
    }

    let label_taken = Spi::get_one::<bool>(&format!(
        "SELECT EXISTS (SELECT 1 FROM public.{VIEW_TABLE} WHERE lower(label) = lower({}) AND name <> {})",
        quote_literal(&registration.label),
        quote_literal(&registration.name),
    ))
    .map_err(catalog_error("Check view label"))?
    .unwrap_or(false);
    if label_taken {
        return Err(ViewGraphError::DuplicateView {
            name: registration.label,
        });
    }

    let dependencies: Vec<String> = registration.dependencies.iter().map(|d| quote_literal(d)).collect();
    let sql = format!(
        "INSERT INTO public.{VIEW_TABLE} \
         (label, name, definition, is_statement, dependencies, materialized, refresh_automatically, unique_columns) \
         VALUES ({}, {}, {}, {}, ARRAY[{}]::text[], {}, {}, {}::jsonb) \
         ON CONFLICT (name) DO UPDATE SET \
         label = EXCLUDED.label, definition = EXCLUDED.definition, is_statement = EXCLUDED.is_statement, \
         dependencies = EXCLUDED.dependencies, materialized = EXCLUDED.materialized, \
         refresh_automatically = EXCLUDED.refresh_automatically, unique_columns = EXCLUDED.unique_columns",
        quote_literal(&registration.label),
        quote_literal(&registration.name),
        quote_literal(&registration.definition),
        registration.is_statement,
        dependencies.join(", "),
        registration.materialized,
        registration.refresh_automatically,
        quote_literal(&serde_json::to_string(&unique_columns)?),
    );
    Spi::run(&sql).map_err(|e| ViewGraphError::SpiError {
        query: sql.clone(),
        error: e.to_string(),
    })
}

/// Remove a registration; the database view itself is left alone
pub fn unregister_view(name: &str) -> ViewGraphResult<bool> {
    Spi::get_one::<bool>(&format!(
        "WITH deleted AS (DELETE FROM public.{VIEW_TABLE} WHERE name = {} RETURNING 1) \
         SELECT count(*) > 0 FROM deleted",
        quote_literal(name)
    ))
    .map_err(catalog_error("Unregister view"))
    .map(|deleted| deleted.unwrap_or(false))
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_catalog_precedence() {
        let mut registry = ViewRegistry::new();
        registry
            .register(ViewDefinition::materialized("app.Totals", "mv_totals", "SELECT 1"))
            .unwrap();

        let catalog = assemble_catalog(
            vec!["app_order".to_string(), "orders".to_string()],
            &registry,
            vec![ModelEntry::new("app.Order", "app_order").with_field("customer", "customer_id")],
        );

        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.by_table("app_order").unwrap().label, "app.Order");
        assert!(catalog.by_label("public.app_order").is_none());
        assert_eq!(catalog.by_label("public.orders").unwrap().db_table, "orders");
        assert_eq!(catalog.by_label("app.totals").unwrap().db_table, "mv_totals");
    }
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;

    use super::*;

    fn registration(label: &str, name: &str) -> ViewRegistration {
        ViewRegistration {
            label: label.to_string(),
            name: name.to_string(),
            definition: "SELECT 1 AS one".to_string(),
            dependencies: Vec::new(),
            materialized: false,
            refresh_automatically: true,
            unique_columns: serde_json::json!([]),
            is_statement: false,
        }
    }

    #[pg_test]
    fn test_metadata_tables_exist() {
        for table in ["pg_viewgraph_model", "pg_viewgraph_view", "pg_viewgraph_audit_log"] {
            let exists = Spi::get_one::<bool>(&format!("SELECT to_regclass('public.{table}') IS NOT NULL"));
            assert_eq!(exists, Ok(Some(true)), "{table} should exist");
        }
    }

    #[pg_test]
    fn test_register_and_load_round_trip() {
        register_model("app.Order", "meta_order", serde_json::json!({"customer": "customer_id"})).unwrap();

        let mut first = registration("app.Second", "v_meta_second");
        first.dependencies = vec!["app.Order".to_string()];
        register_view(first).unwrap();

        let mut second = registration("app.First", "mv_meta_first");
        second.materialized = true;
        second.unique_columns = serde_json::json!([["customer"]]);
        register_view(second).unwrap();

        // re-registering keeps the original position
        register_view(registration("app.Second", "v_meta_second")).unwrap();

        let registry = load_registry().unwrap();
        let names: Vec<&str> = registry.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["v_meta_second", "mv_meta_first"]);
        assert!(registry.get("v_meta_second").unwrap().dependencies.is_empty());
        assert_eq!(
            registry.get("mv_meta_first").unwrap().unique_columns,
            vec![vec!["customer".to_string()]]
        );

        let catalog = load_catalog(&registry).unwrap();
        assert_eq!(catalog.by_label("app.Order").unwrap().column_for("customer"), "customer_id");
        assert!(catalog.by_table("mv_meta_first").is_some());
    }

    #[pg_test]
    fn test_register_rejects_bad_input() {
        assert!(register_view(registration("app.Bad", "v; DROP TABLE x")).is_err());
        assert!(register_model("app.Bad", "bad table", serde_json::json!({})).is_err());

        register_view(registration("app.Taken", "v_taken_one")).unwrap();
        let err = register_view(registration("app.taken", "v_taken_two")).unwrap_err();
        assert_eq!(err.sqlstate(), "42710");
    }

    #[pg_test]
    fn test_unregister_view() {
        register_view(registration("app.Gone", "v_meta_gone")).unwrap();
        assert_eq!(unregister_view("v_meta_gone"), Ok(true));
        assert_eq!(unregister_view("v_meta_gone"), Ok(false));
    }

    #[pg_test]
    fn test_introspection_skips_extension_tables() {
        Spi::run("CREATE TABLE meta_plain (id int)").unwrap();
        Spi::run("CREATE TABLE meta_plain_scheduled_refresh_abcd1234 (schedule_refresh boolean)").unwrap();

        let tables = introspect_tables().unwrap();
        assert!(tables.contains(&"meta_plain".to_string()));
        assert!(!tables.iter().any(|t| t.starts_with("pg_viewgraph_")));
        assert!(!tables.iter().any(|t| t.contains("_scheduled_refresh_")));
    }
}
