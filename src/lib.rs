use pgrx::prelude::*;
use pgrx::JsonB;

mod audit;
mod spi;
pub mod catalog;
pub mod config;
pub mod ddl;
pub mod dependency;
pub mod error;
pub mod metadata;
pub mod refresh;
pub mod registry;
pub mod session;
pub mod validation;

pub use error::{ViewGraphError, ViewGraphResult};

pg_module_magic!();

/// Get the version of the pg_viewgraph extension
#[pg_extern]
fn pg_viewgraph_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Register (or re-map) a model label to the table that stores it
///
/// Usage: SELECT pg_viewgraph_register_model('app.Order', 'app_order', '{"customer": "customer_id"}');
#[pg_extern]
fn pg_viewgraph_register_model(
    label: &str,
    db_table: &str,
    fields: default!(JsonB, "'{}'"),
) -> Result<String, String> {
    match metadata::register_model(label, db_table, fields.0) {
        Ok(()) => Ok(format!("Model '{label}' registered")),
        Err(e) => Err(format!("Failed to register model: {e}")),
    }
}

/// Register a view definition; registration order is kept across updates
#[pg_extern]
#[allow(clippy::too_many_arguments)]
fn pg_viewgraph_register_view(
    label: &str,
    name: &str,
    definition: &str,
    dependencies: Vec<String>,
    materialized: default!(bool, false),
    refresh_automatically: default!(bool, true),
    unique_columns: default!(JsonB, "'[]'"),
    is_statement: default!(bool, false),
) -> Result<String, String> {
    let registration = metadata::ViewRegistration {
        label: label.to_string(),
        name: name.to_string(),
        definition: definition.to_string(),
        dependencies,
        materialized,
        refresh_automatically,
        unique_columns: unique_columns.0,
        is_statement,
    };

    match metadata::register_view(registration) {
        Ok(()) => Ok(format!("View '{name}' registered")),
        Err(e) => Err(format!("Failed to register view: {e}")),
    }
}

/// Remove a view registration; returns false when nothing was registered
#[pg_extern]
fn pg_viewgraph_unregister_view(name: &str) -> Result<bool, String> {
    metadata::unregister_view(name).map_err(|e| format!("Failed to unregister view: {e}"))
}

/// Initialize the extension
#[pg_guard]
extern "C" fn _PG_init() {
    config::register_gucs();
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;

    use crate::ViewGraphError;

    #[pg_test]
    fn test_version_callable_from_sql() {
        let version = Spi::get_one::<String>("SELECT pg_viewgraph_version()");
        assert_eq!(version, Ok(Some(env!("CARGO_PKG_VERSION").to_string())));
    }

    #[pg_test]
    #[should_panic(expected = "No view registered under 'mv_missing'")]
    fn test_error_propagates_to_postgres() {
        Err::<(), _>(ViewGraphError::UnknownView {
            name: "mv_missing".to_string(),
        })
        .unwrap();
    }

    #[pg_test]
    #[should_panic(expected = "Failed to register view")]
    fn test_invalid_registration_raises() {
        Spi::run("SELECT pg_viewgraph_register_view('app.X', 'bad name', 'SELECT 1', ARRAY[]::text[])").unwrap();
    }

    #[pg_test]
    fn test_gucs_registered() {
        let log_ddl = Spi::get_one::<String>("SELECT current_setting('pg_viewgraph.log_ddl')");
        assert_eq!(log_ddl, Ok(Some("off".to_string())));
        let validate = Spi::get_one::<String>("SELECT current_setting('pg_viewgraph.validate_on_create')");
        assert_eq!(validate, Ok(Some("on".to_string())));
    }
}

/// Required by `cargo pgrx test`
#[cfg(test)]
pub mod pg_test {
    pub fn setup(_options: Vec<&str>) {}

    pub fn postgresql_conf_options() -> Vec<&'static str> {
        vec!["shared_preload_libraries = 'pg_viewgraph'"]
    }
}
