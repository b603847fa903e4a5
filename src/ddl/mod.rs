//! DDL Operations: view creation, dropping and refresh
//!
//! The orchestration itself lives in plain Rust (`create`, `drop`,
//! `crate::refresh`) and runs against any [`crate::session::Session`].
//! The functions below are the SQL entry points: they load the registry
//! and catalog from the metadata tables and run the command through
//! [`SpiSession`] inside the caller's transaction.
//!
//! ## Typical use
//!
//! ```sql
//! SELECT pg_viewgraph_register_model('app.Order', 'app_order');
//! SELECT pg_viewgraph_register_view(
//!     'app.OrderTotals', 'mv_order_totals',
//!     'SELECT order_id, sum(amount) AS total FROM app_order GROUP BY order_id',
//!     ARRAY['app.Order'],
//!     materialized => true,
//!     unique_columns => '[["order_id"]]');
//! SELECT pg_viewgraph_create_views();
//! ```

pub mod create;
pub mod drop;

pub use create::{create_views, CreateOptions, CreateReport};
pub use drop::{drop_views, DropReport};

use pgrx::prelude::*;
use pgrx::JsonB;
use serde::Serialize;

use crate::catalog::TableCatalog;
use crate::dependency::{DependencyGraph, RefreshPlan};
use crate::error::ViewGraphResult;
use crate::registry::ViewRegistry;
use crate::spi::SpiSession;
use crate::{audit, config, metadata};

fn load() -> ViewGraphResult<(ViewRegistry, TableCatalog)> {
    let registry = metadata::load_registry()?;
    let catalog = metadata::load_catalog(&registry)?;
    Ok((registry, catalog))
}

fn to_jsonb<T: Serialize>(value: &T) -> Result<JsonB, String> {
    serde_json::to_value(value)
        .map(JsonB)
        .map_err(|e| format!("Failed to serialize result: {e}"))
}

/// SQL function: create every registered view, refresh materialized views
/// and install refresh triggers
///
/// Usage: SELECT pg_viewgraph_create_views(force => true);
#[pg_extern]
fn pg_viewgraph_create_views(
    force: default!(bool, false),
    validate_only: default!(bool, false),
) -> Result<JsonB, String> {
    let (registry, catalog) = load().map_err(|e| format!("Failed to load view registry: {e}"))?;
    let options = CreateOptions {
        force,
        validate_only,
        validate: config::validate_on_create(),
    };

    let report = create_views(&mut SpiSession::new(), &registry, &catalog, options).map_err(|e| {
        if e.is_configuration() {
            format!("Invalid view configuration, nothing was executed: {e}")
        } else {
            format!("Failed to create views: {e}")
        }
    })?;

    if !validate_only {
        if let Err(e) = audit::log_create(&report, force) {
            warning!("Failed to log view creation: {}", e);
        }
    }

    to_jsonb(&report)
}

/// SQL function: drop every registered view and its refresh triggers
#[pg_extern]
fn pg_viewgraph_drop_views() -> Result<JsonB, String> {
    let (registry, catalog) = load().map_err(|e| format!("Failed to load view registry: {e}"))?;

    let report = drop_views(&mut SpiSession::new(), &registry, &catalog)
        .map_err(|e| format!("Failed to drop views: {e}"))?;

    if let Err(e) = audit::log_drop(&report) {
        warning!("Failed to log view drop: {}", e);
    }

    to_jsonb(&report)
}

/// SQL function: dependency validator warnings, without executing anything
#[pg_extern]
fn pg_viewgraph_validate() -> Result<JsonB, String> {
    let (registry, catalog) = load().map_err(|e| format!("Failed to load view registry: {e}"))?;
    let warnings = crate::validation::validate_dependencies(&registry, &catalog).map_err(|e| e.to_string())?;
    to_jsonb(&warnings)
}

/// SQL function: base table -> ordered materialized views refreshed on change
#[pg_extern]
fn pg_viewgraph_refresh_plan() -> Result<JsonB, String> {
    let (registry, catalog) = load().map_err(|e| format!("Failed to load view registry: {e}"))?;
    let graph = DependencyGraph::build(&registry, &catalog).map_err(|e| e.to_string())?;
    to_jsonb(&RefreshPlan::build(&graph))
}

/// SQL function: refresh one materialized view now
///
/// Usage: SELECT pg_viewgraph_refresh('mv_daily_sales');
#[pg_extern]
fn pg_viewgraph_refresh(name: &str, concurrently: default!(Option<bool>, "NULL")) -> Result<String, String> {
    let registry = metadata::load_registry().map_err(|e| format!("Failed to load view registry: {e}"))?;
    crate::refresh::refresh_view(&mut SpiSession::new(), &registry, name, concurrently)
        .map_err(|e| format!("Failed to refresh {name}: {e}"))
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;

    fn setup_orders() {
        Spi::run("CREATE TABLE app_order (id serial PRIMARY KEY, amount int NOT NULL)").unwrap();
        Spi::run("SELECT pg_viewgraph_register_model('app.Order', 'app_order')").unwrap();
        Spi::run(
            "SELECT pg_viewgraph_register_view(
                'app.OrderTotals', 'mv_order_totals',
                'SELECT count(*) AS orders, coalesce(sum(amount), 0) AS total, 1 AS id FROM app_order',
                ARRAY['app.Order'],
                materialized => true,
                unique_columns => '[[\"id\"]]')",
        )
        .unwrap();
    }

    #[pg_test]
    fn test_create_views_report() {
        setup_orders();
        Spi::run(
            "SELECT pg_viewgraph_register_view('app.Big', 'v_big_totals',
                'SELECT * FROM mv_order_totals WHERE total > 100', ARRAY['app.OrderTotals'])",
        )
        .unwrap();

        let report = Spi::get_one::<pgrx::JsonB>("SELECT pg_viewgraph_create_views()").unwrap().unwrap();
        assert_eq!(report.0["created"], serde_json::json!(["mv_order_totals", "v_big_totals"]));
        assert_eq!(report.0["trigger_tables"], serde_json::json!(["app_order"]));

        let kind = Spi::get_one::<String>("SELECT relkind::text FROM pg_class WHERE relname = 'mv_order_totals'");
        assert_eq!(kind, Ok(Some("m".to_string())));
        let audited = Spi::get_one::<i64>(
            "SELECT count(*) FROM pg_viewgraph_audit_log WHERE operation = 'CREATE_VIEWS'",
        );
        assert_eq!(audited, Ok(Some(1)));
    }

    #[pg_test]
    fn test_deferred_refresh_fires_once() {
        Spi::run("CREATE TABLE app_order (id serial PRIMARY KEY, amount int NOT NULL)").unwrap();
        // every evaluation of the view query draws one value
        Spi::run("CREATE SEQUENCE order_totals_runs").unwrap();
        Spi::run("SELECT pg_viewgraph_register_model('app.Order', 'app_order')").unwrap();
        Spi::run(
            "SELECT pg_viewgraph_register_view(
                'app.OrderTotals', 'mv_order_totals',
                'SELECT count(*) AS orders, coalesce(sum(amount), 0) AS total, 1 AS id,
                        nextval(''order_totals_runs'') AS run FROM app_order',
                ARRAY['app.Order'],
                materialized => true,
                unique_columns => '[[\"id\"]]')",
        )
        .unwrap();
        Spi::run("SELECT pg_viewgraph_create_views()").unwrap();

        let marker = Spi::get_one::<String>(
            "SELECT relname::text FROM pg_class WHERE relname LIKE 'app_order_scheduled_refresh_%'",
        )
        .unwrap()
        .unwrap();
        let runs_before = Spi::get_one::<i64>("SELECT last_value FROM order_totals_runs").unwrap().unwrap();

        Spi::run("INSERT INTO app_order (amount) VALUES (10)").unwrap();
        for _ in 0..5 {
            Spi::run("UPDATE app_order SET amount = amount + 1").unwrap();
        }

        let pending = Spi::get_one::<i64>(&format!("SELECT count(*) FROM \"{marker}\""));
        assert_eq!(pending, Ok(Some(1)));
        let stale = Spi::get_one::<i64>("SELECT orders FROM mv_order_totals");
        assert_eq!(stale, Ok(Some(0)));
        let runs = Spi::get_one::<i64>("SELECT last_value FROM order_totals_runs");
        assert_eq!(runs, Ok(Some(runs_before)));

        Spi::run("SET CONSTRAINTS ALL IMMEDIATE").unwrap();

        let pending = Spi::get_one::<i64>(&format!("SELECT count(*) FROM \"{marker}\""));
        assert_eq!(pending, Ok(Some(0)));
        let total = Spi::get_one::<i64>("SELECT total FROM mv_order_totals");
        assert_eq!(total, Ok(Some(15)));
        // six writes, one refresh
        let runs = Spi::get_one::<i64>("SELECT last_value FROM order_totals_runs");
        assert_eq!(runs, Ok(Some(runs_before + 1)));
        let run = Spi::get_one::<i64>("SELECT run FROM mv_order_totals");
        assert_eq!(run, Ok(Some(runs_before + 1)));
    }

    #[pg_test]
    #[should_panic(expected = "Invalid view configuration, nothing was executed")]
    fn test_configuration_error_is_reported_as_such() {
        setup_orders();
        Spi::run(
            "SELECT pg_viewgraph_register_view('app.Broken', 'v_broken', 'SELECT 1', ARRAY['app.Nowhere'])",
        )
        .unwrap();
        Spi::run("SELECT pg_viewgraph_create_views()").unwrap();
    }

    #[pg_test]
    fn test_redeclared_plain_view_keeps_base_table_writable() {
        setup_orders();
        Spi::run("SELECT pg_viewgraph_create_views()").unwrap();

        Spi::run("UPDATE pg_viewgraph_view SET materialized = false, unique_columns = '[]' WHERE name = 'mv_order_totals'")
            .unwrap();
        let report = Spi::get_one::<pgrx::JsonB>("SELECT pg_viewgraph_create_views(force => true)").unwrap().unwrap();
        assert_eq!(report.0["untriggered_tables"], serde_json::json!(["app_order"]));

        let triggers = Spi::get_one::<i64>(
            "SELECT count(*) FROM pg_trigger WHERE tgrelid = 'app_order'::regclass AND NOT tgisinternal",
        );
        assert_eq!(triggers, Ok(Some(0)));

        Spi::run("INSERT INTO app_order (amount) VALUES (10)").unwrap();
        Spi::run("SET CONSTRAINTS ALL IMMEDIATE").unwrap();
        let orders = Spi::get_one::<i64>("SELECT orders FROM mv_order_totals");
        assert_eq!(orders, Ok(Some(1)));
    }

    #[pg_test]
    fn test_validate_only_leaves_database_untouched() {
        setup_orders();
        Spi::run("SELECT pg_viewgraph_create_views(force => true, validate_only => true)").unwrap();

        let exists = Spi::get_one::<bool>("SELECT to_regclass('mv_order_totals') IS NOT NULL");
        assert_eq!(exists, Ok(Some(false)));
    }

    #[pg_test]
    fn test_drop_handles_changed_kind() {
        setup_orders();
        Spi::run("SELECT pg_viewgraph_create_views()").unwrap();

        // re-declared as a plain view while the database still holds the materialized one
        Spi::run("UPDATE pg_viewgraph_view SET materialized = false, unique_columns = '[]' WHERE name = 'mv_order_totals'")
            .unwrap();
        let report = Spi::get_one::<pgrx::JsonB>("SELECT pg_viewgraph_drop_views()").unwrap().unwrap();

        assert_eq!(report.0["dropped"][0]["kind"], serde_json::json!("MaterializedView"));
        let exists = Spi::get_one::<bool>("SELECT to_regclass('mv_order_totals') IS NOT NULL");
        assert_eq!(exists, Ok(Some(false)));
    }

    #[pg_test]
    fn test_refresh_plan_and_manual_refresh() {
        setup_orders();
        Spi::run("SELECT pg_viewgraph_create_views()").unwrap();

        let plan = Spi::get_one::<pgrx::JsonB>("SELECT pg_viewgraph_refresh_plan()").unwrap().unwrap();
        assert_eq!(plan.0, serde_json::json!({"app_order": ["mv_order_totals"]}));

        let sql = Spi::get_one::<String>("SELECT pg_viewgraph_refresh('mv_order_totals')");
        assert_eq!(
            sql,
            Ok(Some("REFRESH MATERIALIZED VIEW CONCURRENTLY \"mv_order_totals\"".to_string()))
        );
    }

    #[pg_test]
    fn test_validate_reports_missing_dependency() {
        Spi::run("CREATE TABLE app_customer (id int)").unwrap();
        setup_orders();
        Spi::run("SELECT pg_viewgraph_register_model('app.Customer', 'app_customer')").unwrap();
        Spi::run(
            "SELECT pg_viewgraph_register_view('app.Report', 'v_report',
                'SELECT * FROM app_order JOIN app_customer ON true', ARRAY['app.Order'])",
        )
        .unwrap();

        let warnings = Spi::get_one::<pgrx::JsonB>("SELECT pg_viewgraph_validate()").unwrap().unwrap();
        assert_eq!(warnings.0[0]["view"], serde_json::json!("app.Report"));
        assert_eq!(warnings.0[0]["missing"], serde_json::json!(["app.Customer"]));
        assert_eq!(warnings.0[0]["suggested"], serde_json::json!(["app.Customer", "app.Order"]));
    }
}
