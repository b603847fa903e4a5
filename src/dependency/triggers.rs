//! Refresh trigger DDL
//!
//! For every base table feeding an automatically refreshed materialized
//! view we install:
//!
//! - an unlogged marker table `<table>_scheduled_refresh_<hash>`
//! - a scheduling function and a DEFERRABLE constraint trigger on the base
//!   table that inserts one marker row if none is pending
//! - a refresh function and an INITIALLY DEFERRED constraint trigger on the
//!   marker table that refreshes the views at commit and clears the marker
//!
//! However many rows change in a transaction, the views are refreshed once.
//! Names carry a digest of the table name, so regenerating for the same
//! table always yields the same objects.

use sha2::{Digest, Sha256};

use crate::catalog::quote_name;
use crate::config::{MAX_IDENTIFIER_LEN, NAME_HASH_LEN};
use crate::registry::ViewDefinition;

/// Short hex digest of a table name
pub fn name_hash(table: &str) -> String {
    let digest = Sha256::digest(table.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(NAME_HASH_LEN);
    hash
}

/// `prefix + table + suffix + '_' + hash`, shortening only the table part
/// so the hash survives PostgreSQL's identifier truncation.
fn derived_name(prefix: &str, table: &str, suffix: &str, hash: &str) -> String {
    let sanitized: String = table
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    let fixed = prefix.len() + suffix.len() + 1 + hash.len();
    let room = MAX_IDENTIFIER_LEN.saturating_sub(fixed);
    let table_part: String = sanitized.chars().take(room).collect();
    format!("{prefix}{table_part}{suffix}_{hash}")
}

/// Names of the objects generated for one base table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshObjects {
    pub table: String,
    pub hash: String,
    pub marker_table: String,
    pub refresh_function: String,
    pub schedule_function: String,
    pub marker_trigger: String,
    pub table_trigger: String,
}

impl RefreshObjects {
    pub fn for_table(table: &str) -> Self {
        let hash = name_hash(table);
        Self {
            table: table.to_string(),
            marker_table: derived_name("", table, "_scheduled_refresh", &hash),
            refresh_function: derived_name("", table, "_refresh_materialized_views", &hash),
            schedule_function: derived_name("schedule_", table, "_refresh_materialized_view", &hash),
            marker_trigger: derived_name("", table, "_schedule_triggers_refresh", &hash),
            table_trigger: derived_name("", table, "_trigger_schedule_refresh", &hash),
            hash,
        }
    }
}

/// `REFRESH MATERIALIZED VIEW [CONCURRENTLY] <view>`
pub fn refresh_statement(view: &str, concurrently: bool) -> String {
    if concurrently {
        format!("REFRESH MATERIALIZED VIEW CONCURRENTLY {}", quote_name(view))
    } else {
        format!("REFRESH MATERIALIZED VIEW {}", quote_name(view))
    }
}

/// Statements installing deferred refresh for `table`.
///
/// `views` is the table's ordered refresh list; each view refreshes
/// concurrently when it declares a unique column group.
pub fn install_statements(table: &str, views: &[&ViewDefinition]) -> Vec<String> {
    let names = RefreshObjects::for_table(table);
    let marker = quote_name(&names.marker_table);
    let table_q = quote_name(table);

    let refreshes: String = views
        .iter()
        .map(|v| format!("    {};\n", refresh_statement(&v.name, v.refreshes_concurrently())))
        .collect();

    vec![
        format!("DROP TABLE IF EXISTS {marker} CASCADE"),
        format!("CREATE UNLOGGED TABLE {marker} (\n    schedule_refresh BOOLEAN\n)"),
        format!(
            "CREATE OR REPLACE FUNCTION {func}()\n\
             RETURNS TRIGGER LANGUAGE plpgsql\n\
             AS $$\n\
             BEGIN\n\
             {refreshes}    DELETE FROM {marker};\n    RETURN NULL;\n\
             END $$",
            func = quote_name(&names.refresh_function),
        ),
        format!(
            "CREATE OR REPLACE FUNCTION {func}()\n\
             RETURNS TRIGGER LANGUAGE plpgsql\n\
             AS $$\n\
             BEGIN\n    \
             IF NOT EXISTS (SELECT 1 FROM {marker} LIMIT 1) THEN\n        \
             INSERT INTO {marker} VALUES (true);\n    \
             END IF;\n    \
             RETURN NULL;\n\
             END $$",
            func = quote_name(&names.schedule_function),
        ),
        format!(
            "DROP TRIGGER IF EXISTS {} ON {marker}",
            quote_name(&names.marker_trigger)
        ),
        format!(
            "CREATE CONSTRAINT TRIGGER {}\n\
             AFTER INSERT ON {marker}\n\
             INITIALLY DEFERRED\n\
             FOR EACH ROW EXECUTE PROCEDURE {}()",
            quote_name(&names.marker_trigger),
            quote_name(&names.refresh_function),
        ),
        format!(
            "DROP TRIGGER IF EXISTS {} ON {table_q}",
            quote_name(&names.table_trigger)
        ),
        format!(
            "CREATE CONSTRAINT TRIGGER {}\n\
             AFTER INSERT OR UPDATE OR DELETE ON {table_q}\n\
             DEFERRABLE\n\
             FOR EACH ROW EXECUTE PROCEDURE {}()",
            quote_name(&names.table_trigger),
            quote_name(&names.schedule_function),
        ),
    ]
}

/// Statements removing everything `install_statements` created for `table`
pub fn teardown_statements(table: &str) -> Vec<String> {
    let names = RefreshObjects::for_table(table);
    vec![
        format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            quote_name(&names.table_trigger),
            quote_name(table)
        ),
        format!("DROP TABLE IF EXISTS {} CASCADE", quote_name(&names.marker_table)),
        format!("DROP FUNCTION IF EXISTS {}()", quote_name(&names.schedule_function)),
        format!("DROP FUNCTION IF EXISTS {}()", quote_name(&names.refresh_function)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals() -> ViewDefinition {
        ViewDefinition::materialized("app.OrderTotals", "mv_order_totals", "SELECT 1").unique(["order_id"])
    }

    #[test]
    fn test_name_hash_is_short_and_stable() {
        let hash = name_hash("orders");
        assert_eq!(hash.len(), NAME_HASH_LEN);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, name_hash("orders"));
        assert_ne!(hash, name_hash("orders2"));
    }

    #[test]
    fn test_object_names() {
        let names = RefreshObjects::for_table("orders");
        let h = &names.hash;
        assert_eq!(names.marker_table, format!("orders_scheduled_refresh_{h}"));
        assert_eq!(names.refresh_function, format!("orders_refresh_materialized_views_{h}"));
        assert_eq!(names.schedule_function, format!("schedule_orders_refresh_materialized_view_{h}"));
        assert_eq!(names.marker_trigger, format!("orders_schedule_triggers_refresh_{h}"));
        assert_eq!(names.table_trigger, format!("orders_trigger_schedule_refresh_{h}"));
    }

    #[test]
    fn test_long_table_names_keep_hash() {
        let table = "a_really_long_reporting_table_name_that_goes_on_and_on";
        let names = RefreshObjects::for_table(table);
        for name in [
            &names.marker_table,
            &names.refresh_function,
            &names.schedule_function,
            &names.marker_trigger,
            &names.table_trigger,
        ] {
            assert!(name.len() <= MAX_IDENTIFIER_LEN, "{name} too long");
            assert!(name.ends_with(&names.hash));
        }
    }

    #[test]
    fn test_schema_qualified_table_is_sanitized() {
        let names = RefreshObjects::for_table("sales.orders");
        assert!(names.marker_table.starts_with("sales_orders_scheduled_refresh_"));
        let sql = install_statements("sales.orders", &[&totals()]);
        assert!(sql[7].contains("ON \"sales\".\"orders\""));
    }

    #[test]
    fn test_install_statements_shape() {
        let view = totals();
        let sql = install_statements("orders", &[&view]);
        let h = name_hash("orders");

        assert_eq!(sql.len(), 8);
        assert_eq!(sql[0], format!("DROP TABLE IF EXISTS \"orders_scheduled_refresh_{h}\" CASCADE"));
        assert!(sql[1].starts_with("CREATE UNLOGGED TABLE"));
        assert!(sql[2].contains("REFRESH MATERIALIZED VIEW CONCURRENTLY \"mv_order_totals\";"));
        assert!(sql[2].contains(&format!("DELETE FROM \"orders_scheduled_refresh_{h}\"")));
        assert!(sql[3].contains("IF NOT EXISTS"));
        assert!(sql[5].contains("AFTER INSERT ON"));
        assert!(sql[5].contains("INITIALLY DEFERRED"));
        assert!(sql[7].contains("AFTER INSERT OR UPDATE OR DELETE ON \"orders\""));
        assert!(sql[7].contains("DEFERRABLE"));
    }

    #[test]
    fn test_refresh_order_and_concurrency_in_function_body() {
        let upstream = totals();
        let downstream = ViewDefinition::materialized("app.Summary", "mv_summary", "SELECT 1");
        let sql = install_statements("orders", &[&upstream, &downstream]);

        let body = &sql[2];
        let first = body.find("\"mv_order_totals\"").unwrap();
        let second = body.find("REFRESH MATERIALIZED VIEW \"mv_summary\"").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_regeneration_is_byte_identical() {
        let view = totals();
        assert_eq!(install_statements("orders", &[&view]), install_statements("orders", &[&view]));
    }

    #[test]
    fn test_teardown_matches_install_names() {
        let names = RefreshObjects::for_table("orders");
        let sql = teardown_statements("orders").join("\n");
        assert!(sql.contains(&names.table_trigger));
        assert!(sql.contains(&names.marker_table));
        assert!(sql.contains(&names.schedule_function));
        assert!(sql.contains(&names.refresh_function));
    }
}
