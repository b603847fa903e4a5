use pgrx::{GucContext, GucFlags, GucRegistry, GucSetting};

/// Maximum nesting of view-on-view dependencies
/// Guards the graph walks against pathological registrations
pub const MAX_DEPENDENCY_DEPTH: usize = 64;

/// Number of hex characters of the table-name digest used in generated names
pub const NAME_HASH_LEN: usize = 8;

/// PostgreSQL truncates identifiers beyond NAMEDATALEN - 1 bytes
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Registry tables created by the extension
pub const MODEL_TABLE: &str = "pg_viewgraph_model";
pub const VIEW_TABLE: &str = "pg_viewgraph_view";
pub const AUDIT_TABLE: &str = "pg_viewgraph_audit_log";

/// Report every executed statement at INFO instead of DEBUG1
pub static LOG_DDL: GucSetting<bool> = GucSetting::<bool>::new(false);

/// Run the dependency validator before `pg_viewgraph_create_views`
pub static VALIDATE_ON_CREATE: GucSetting<bool> = GucSetting::<bool>::new(true);

/// Register GUC variables; called once from `_PG_init`
pub fn register_gucs() {
    GucRegistry::define_bool_guc(
        "pg_viewgraph.log_ddl",
        "Log every statement issued by pg_viewgraph at INFO level.",
        "When off, generated DDL is only visible at DEBUG1.",
        &LOG_DDL,
        GucContext::Userset,
        GucFlags::default(),
    );

    GucRegistry::define_bool_guc(
        "pg_viewgraph.validate_on_create",
        "Check declared view dependencies against the view SQL before creating views.",
        "Mismatches are reported as warnings and never block creation.",
        &VALIDATE_ON_CREATE,
        GucContext::Userset,
        GucFlags::default(),
    );
}

pub fn log_ddl() -> bool {
    LOG_DDL.get()
}

pub fn validate_on_create() -> bool {
    VALIDATE_ON_CREATE.get()
}
