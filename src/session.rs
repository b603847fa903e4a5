//! Database session seam
//!
//! The orchestration core never talks to the backend directly. Every
//! statement goes through a [`Session`], which the extension layer implements
//! on top of SPI (`crate::spi::SpiSession`) and the unit tests implement with
//! [`testing::RecordingSession`].

use serde::Serialize;

/// Error category reported by a session, enough to tell object-kind
/// mismatches apart from real failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SqlErrorKind {
    /// The named object does not exist (42704 / 42P01)
    UndefinedObject,
    /// The statement expected another kind of relation (42809)
    WrongObjectType,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlError {
    pub kind: SqlErrorKind,
    pub message: String,
}

impl SqlError {
    pub fn new(kind: SqlErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// Map a PostgreSQL SQLSTATE to an error category
    pub fn from_sqlstate(sqlstate: &str, message: impl Into<String>) -> Self {
        let kind = match sqlstate {
            "42704" | "42P01" | "42883" => SqlErrorKind::UndefinedObject,
            "42809" => SqlErrorKind::WrongObjectType,
            _ => SqlErrorKind::Other,
        };
        Self::new(kind, message)
    }

    pub(crate) fn into_error(self, statement: &str) -> crate::ViewGraphError {
        crate::ViewGraphError::StatementFailed {
            statement: statement.to_string(),
            kind: self.kind,
            message: self.message,
        }
    }
}

/// Relation kinds the drop fallback distinguishes (pg_class.relkind)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RelationKind {
    Table,
    View,
    MaterializedView,
}

impl RelationKind {
    pub fn from_relkind(relkind: &str) -> Option<Self> {
        match relkind {
            "r" | "p" => Some(Self::Table),
            "v" => Some(Self::View),
            "m" => Some(Self::MaterializedView),
            _ => None,
        }
    }

    /// Keyword used in `DROP <kind>` / `CREATE <kind>`
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Table => "TABLE",
            Self::View => "VIEW",
            Self::MaterializedView => "MATERIALIZED VIEW",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Debug,
    Info,
    Warning,
}

pub trait Session {
    /// Execute one SQL statement
    fn execute(&mut self, sql: &str) -> Result<(), SqlError>;

    /// Actual kind of an existing relation, `None` when absent or unknown
    fn relation_kind(&mut self, _name: &str) -> Result<Option<RelationKind>, SqlError> {
        Ok(None)
    }

    fn notice(&mut self, _level: NoticeLevel, _message: &str) {}
}

/// Execute a statement, turning a session error into a fatal command error
pub fn run<S: Session + ?Sized>(session: &mut S, sql: &str) -> crate::ViewGraphResult<()> {
    session.notice(NoticeLevel::Debug, sql);
    session.execute(sql).map_err(|e| e.into_error(sql))
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;

    /// Session that records statements and simulates relation kinds.
    ///
    /// `DROP <kind> IF EXISTS <name>` against a relation registered with a
    /// different kind fails with `WrongObjectType`, as PostgreSQL does.
    #[derive(Debug, Default)]
    pub struct RecordingSession {
        pub statements: Vec<String>,
        pub notices: Vec<(NoticeLevel, String)>,
        pub relations: HashMap<String, RelationKind>,
        /// Report relation kinds through `relation_kind`
        pub introspect: bool,
        /// Statements containing this text fail with `Other`
        pub fail_on: Option<String>,
    }

    impl RecordingSession {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_relation(mut self, name: &str, kind: RelationKind) -> Self {
            self.relations.insert(name.to_string(), kind);
            self
        }

        pub fn warnings(&self) -> Vec<&str> {
            self.notices
                .iter()
                .filter(|(level, _)| *level == NoticeLevel::Warning)
                .map(|(_, msg)| msg.as_str())
                .collect()
        }

        fn simulate_drop(&mut self, sql: &str) -> Result<(), SqlError> {
            let kinds = [
                RelationKind::MaterializedView,
                RelationKind::View,
                RelationKind::Table,
            ];
            for kind in kinds {
                let prefix = format!("DROP {} IF EXISTS ", kind.keyword());
                if let Some(rest) = sql.strip_prefix(&prefix) {
                    let name = rest.trim_end_matches(" CASCADE").trim_matches('"').to_string();
                    return match self.relations.get(&name).copied() {
                        Some(actual) if actual != kind => Err(SqlError::new(
                            SqlErrorKind::WrongObjectType,
                            format!("\"{}\" is not a {}", name, kind.keyword().to_lowercase()),
                        )),
                        _ => {
                            self.relations.remove(&name);
                            Ok(())
                        }
                    };
                }
            }
            Ok(())
        }
    }

    impl Session for RecordingSession {
        fn execute(&mut self, sql: &str) -> Result<(), SqlError> {
            if let Some(needle) = &self.fail_on {
                if sql.contains(needle.as_str()) {
                    return Err(SqlError::new(SqlErrorKind::Other, "permission denied"));
                }
            }
            self.simulate_drop(sql)?;
            self.statements.push(sql.to_string());
            Ok(())
        }

        fn relation_kind(&mut self, name: &str) -> Result<Option<RelationKind>, SqlError> {
            if self.introspect {
                Ok(self.relations.get(name).copied())
            } else {
                Ok(None)
            }
        }

        fn notice(&mut self, level: NoticeLevel, message: &str) {
            self.notices.push((level, message.to_string()));
        }
    }
}
