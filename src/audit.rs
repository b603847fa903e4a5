use pgrx::prelude::*;

use crate::config::AUDIT_TABLE;
use crate::metadata::quote_literal;

fn current_user() -> spi::Result<String> {
    Ok(Spi::get_one::<String>("SELECT current_user::text")?.unwrap_or_else(|| "unknown".to_string()))
}

/// Record one create/drop run in `pg_viewgraph_audit_log`
pub fn log_run(operation: &str, details: serde_json::Value) -> spi::Result<()> {
    let mut details = details;
    if let serde_json::Value::Object(map) = &mut details {
        map.insert("version".to_string(), env!("CARGO_PKG_VERSION").into());
    }

    Spi::run(&format!(
        "INSERT INTO public.{AUDIT_TABLE} (operation, performed_by, details)
         VALUES ({}, {}, {}::jsonb)",
        quote_literal(operation),
        quote_literal(&current_user()?),
        quote_literal(&details.to_string())
    ))
}

/// Log a `pg_viewgraph_create_views` run
pub fn log_create(report: &crate::ddl::create::CreateReport, force: bool) -> spi::Result<()> {
    log_run(
        "CREATE_VIEWS",
        serde_json::json!({
            "force": force,
            "created": report.created,
            "refreshed": report.refreshed,
            "trigger_tables": report.trigger_tables,
            "untriggered_tables": report.untriggered_tables,
            "warnings": report.warnings.len(),
        }),
    )
}

/// Log a `pg_viewgraph_drop_views` run
pub fn log_drop(report: &crate::ddl::drop::DropReport) -> spi::Result<()> {
    let dropped: Vec<&str> = report.dropped.iter().map(|d| d.name.as_str()).collect();
    log_run(
        "DROP_VIEWS",
        serde_json::json!({
            "dropped": dropped,
            "trigger_tables": report.trigger_tables,
        }),
    )
}
