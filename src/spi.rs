//! SPI-backed [`Session`]
//!
//! Statements run in the caller's transaction. A failing statement normally
//! raises a PostgreSQL ERROR and aborts the whole command, so the drop
//! fallback relies on `relation_kind` to pick the right `DROP` up front.

use pgrx::prelude::*;

use crate::catalog::quote_name;
use crate::config;
use crate::session::{NoticeLevel, RelationKind, Session, SqlError, SqlErrorKind};

#[derive(Debug, Default)]
pub struct SpiSession;

impl SpiSession {
    pub fn new() -> Self {
        Self
    }
}

fn spi_failure(e: pgrx::spi::Error) -> SqlError {
    SqlError::new(SqlErrorKind::Other, e.to_string())
}

impl Session for SpiSession {
    fn execute(&mut self, sql: &str) -> Result<(), SqlError> {
        Spi::run(sql).map_err(spi_failure)
    }

    fn relation_kind(&mut self, name: &str) -> Result<Option<RelationKind>, SqlError> {
        // the scalar subquery always yields one row, NULL when absent
        let query = format!(
            "SELECT (SELECT c.relkind::text FROM pg_class c WHERE c.oid = to_regclass('{}'))",
            quote_name(name).replace('\'', "''")
        );
        let relkind = Spi::get_one::<String>(&query).map_err(spi_failure)?;
        Ok(relkind.as_deref().and_then(RelationKind::from_relkind))
    }

    fn notice(&mut self, level: NoticeLevel, message: &str) {
        match level {
            NoticeLevel::Debug if config::log_ddl() => info!("{}", message),
            NoticeLevel::Debug => pgrx::debug1!("{}", message),
            NoticeLevel::Info => info!("{}", message),
            NoticeLevel::Warning => warning!("{}", message),
        }
    }
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;

    use crate::session::{RelationKind, Session};
    use super::SpiSession;

    #[pg_test]
    fn test_relation_kind_from_catalog() {
        Spi::run("CREATE TABLE spi_kind_t (id int)").unwrap();
        Spi::run("CREATE VIEW spi_kind_v AS SELECT * FROM spi_kind_t").unwrap();
        Spi::run("CREATE MATERIALIZED VIEW spi_kind_m AS SELECT * FROM spi_kind_t").unwrap();

        let mut session = SpiSession::new();
        assert_eq!(session.relation_kind("spi_kind_t").unwrap(), Some(RelationKind::Table));
        assert_eq!(session.relation_kind("spi_kind_v").unwrap(), Some(RelationKind::View));
        assert_eq!(session.relation_kind("spi_kind_m").unwrap(), Some(RelationKind::MaterializedView));
        assert_eq!(session.relation_kind("spi_kind_missing").unwrap(), None);
    }

    #[pg_test]
    fn test_execute_runs_statement() {
        let mut session = SpiSession::new();
        session.execute("CREATE TABLE spi_exec_t (id int)").unwrap();
        let exists = Spi::get_one::<bool>("SELECT to_regclass('spi_exec_t') IS NOT NULL").unwrap();
        assert_eq!(exists, Some(true));
    }
}
