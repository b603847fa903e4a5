use std::fmt;

use crate::session::SqlErrorKind;

pub mod testing;

/// Main error type for the pg_viewgraph extension
#[derive(Debug, Clone, PartialEq)]
pub enum ViewGraphError {
    // ============ Configuration Errors (55xxx / 42xxx) ============
    /// A declared dependency label names neither a table nor a view
    UnresolvableDependency {
        view: String,
        label: String,
    },

    /// A view (transitively) depends on itself
    CircularDependency {
        cycle: Vec<String>,
    },

    /// Dependency chain deeper than the configured limit
    DependencyDepthExceeded {
        view: String,
        max_depth: usize,
    },

    /// An automatically refreshed materialized view reads from a manually refreshed one
    ManualRefreshDependency {
        view: String,
        dependency: String,
    },

    /// View definition cannot be turned into DDL
    InvalidDefinition {
        view: String,
        reason: String,
    },

    /// View name or label registered twice
    DuplicateView {
        name: String,
    },

    /// No view registered under this name
    UnknownView {
        name: String,
    },

    /// Refresh requested on a plain view
    NotMaterialized {
        name: String,
    },

    /// Identifier rejected before reaching generated SQL
    InvalidIdentifier {
        parameter: String,
        value: String,
        reason: String,
    },

    // ============ Execution Errors ============
    /// A generated statement failed against the database
    StatementFailed {
        statement: String,
        kind: SqlErrorKind,
        message: String,
    },

    // ============ I/O and System Errors (XX000) ============
    /// PostgreSQL catalog operation failed
    CatalogError {
        operation: String,
        pg_error: String,
    },

    /// SPI operation failed
    SpiError {
        query: String,
        error: String,
    },

    /// Serialization/deserialization failed
    SerializationError {
        message: String,
    },

    /// Internal error (bug in extension)
    InternalError {
        message: String,
        file: &'static str,
        line: u32,
    },
}

impl ViewGraphError {
    /// Get PostgreSQL SQLSTATE code for this error
    pub fn sqlstate(&self) -> &'static str {
        use ViewGraphError::*;
        match self {
            UnresolvableDependency { .. } => "42P01", // Undefined table
            CircularDependency { .. } => "55P03",
            DependencyDepthExceeded { .. } => "54001", // Statement too complex
            ManualRefreshDependency { .. } => "55000", // Object not in prerequisite state
            InvalidDefinition { .. } => "42601", // Syntax error
            DuplicateView { .. } => "42710", // Duplicate object
            UnknownView { .. } => "42704", // Undefined object
            NotMaterialized { .. } => "42809", // Wrong object type
            InvalidIdentifier { .. } => "42602", // Invalid name

            StatementFailed { kind, .. } => match kind {
                SqlErrorKind::UndefinedObject => "42704",
                SqlErrorKind::WrongObjectType => "42809",
                SqlErrorKind::Other => "XX000",
            },

            CatalogError { .. } => "XX000",
            SpiError { .. } => "XX000",
            SerializationError { .. } => "XX000",
            InternalError { .. } => "XX000",
        }
    }

    /// Configuration errors are raised before any DDL runs
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnresolvableDependency { .. }
                | Self::CircularDependency { .. }
                | Self::DependencyDepthExceeded { .. }
                | Self::ManualRefreshDependency { .. }
                | Self::InvalidDefinition { .. }
                | Self::DuplicateView { .. }
        )
    }

    /// Create internal error with file/line info
    pub fn internal(message: String, file: &'static str, line: u32) -> Self {
        ViewGraphError::InternalError { message, file, line }
    }
}

fn truncated(sql: &str) -> &str {
    match sql.char_indices().nth(100) {
        Some((idx, _)) => &sql[..idx],
        None => sql,
    }
}

impl fmt::Display for ViewGraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ViewGraphError::*;
        match self {
            UnresolvableDependency { view, label } => {
                write!(f, "View '{}' declares dependency '{}' which is neither a known table nor a registered view", view, label)
            }
            CircularDependency { cycle } => {
                write!(f, "Circular dependency detected: {}", cycle.join(" → "))
            }
            DependencyDepthExceeded { view, max_depth } => {
                write!(f, "Dependencies of '{}' nest deeper than {} views", view, max_depth)
            }
            ManualRefreshDependency { view, dependency } => {
                write!(
                    f,
                    "Materialized view '{}' is refreshed automatically but depends on '{}', which is refreshed manually. \
                     An automatically refreshed materialized view must have all its materialized view dependencies \
                     automatically refreshed also.",
                    view, dependency
                )
            }
            InvalidDefinition { view, reason } => {
                write!(f, "Invalid definition for view '{}': {}", view, reason)
            }
            DuplicateView { name } => {
                write!(f, "View '{}' is already registered", name)
            }
            UnknownView { name } => {
                write!(f, "No view registered under '{}'", name)
            }
            NotMaterialized { name } => {
                write!(f, "'{}' is not a materialized view", name)
            }
            InvalidIdentifier { parameter, value, reason } => {
                write!(f, "Invalid {} '{}': {}", parameter, value, reason)
            }
            StatementFailed { statement, kind, message } => {
                write!(f, "Statement failed ({:?}): {}\nStatement: {}", kind, message, truncated(statement))
            }
            CatalogError { operation, pg_error } => {
                write!(f, "Catalog operation '{}' failed: {}", operation, pg_error)
            }
            SpiError { query, error } => {
                write!(f, "SPI query failed: {}\nQuery: {}", error, truncated(query))
            }
            SerializationError { message } => {
                write!(f, "Serialization error: {}", message)
            }
            InternalError { message, file, line } => {
                write!(f, "Internal error at {}:{}: {}\nPlease report this bug.", file, line, message)
            }
        }
    }
}

impl std::error::Error for ViewGraphError {}

/// Result type for pg_viewgraph operations
pub type ViewGraphResult<T> = Result<T, ViewGraphError>;

/// Convert SpiError to ViewGraphError
impl From<pgrx::spi::Error> for ViewGraphError {
    fn from(e: pgrx::spi::Error) -> Self {
        ViewGraphError::SpiError {
            query: "Unknown".to_string(),
            error: e.to_string(),
        }
    }
}

/// Convert serde_json::Error to ViewGraphError
impl From<serde_json::Error> for ViewGraphError {
    fn from(e: serde_json::Error) -> Self {
        ViewGraphError::SerializationError {
            message: format!("JSON serialization error: {}", e),
        }
    }
}

/// Convert regex::Error to ViewGraphError
impl From<regex::Error> for ViewGraphError {
    fn from(e: regex::Error) -> Self {
        ViewGraphError::InternalError {
            message: format!("Regex compilation failed: {}", e),
            file: file!(),
            line: line!(),
        }
    }
}

/// Helper macro for creating internal errors with automatic file/line
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::ViewGraphError::internal($msg.to_string(), file!(), line!())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::ViewGraphError::internal(format!($fmt, $($arg)*), file!(), line!())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolvable_dependency_message() {
        let err = ViewGraphError::UnresolvableDependency {
            view: "v_report".to_string(),
            label: "app.Missing".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("v_report"));
        assert!(msg.contains("app.Missing"));
        assert_eq!(err.sqlstate(), "42P01");
        assert!(err.is_configuration());
    }

    #[test]
    fn test_circular_dependency_message() {
        let err = ViewGraphError::CircularDependency {
            cycle: vec!["v_a".to_string(), "v_b".to_string(), "v_a".to_string()],
        };

        let msg = err.to_string();
        assert!(msg.contains("v_a → v_b → v_a"));
        assert_eq!(err.sqlstate(), "55P03");
    }

    #[test]
    fn test_statement_failed_sqlstate_follows_kind() {
        let err = ViewGraphError::StatementFailed {
            statement: "DROP VIEW IF EXISTS t CASCADE".to_string(),
            kind: SqlErrorKind::WrongObjectType,
            message: "\"t\" is not a view".to_string(),
        };
        assert_eq!(err.sqlstate(), "42809");
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_long_statement_is_truncated() {
        let err = ViewGraphError::SpiError {
            query: "x".repeat(500),
            error: "boom".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.len() < 200);
    }

    #[test]
    fn test_internal_error_macro() {
        let err = internal_error!("Test error at {}", "location");

        match err {
            ViewGraphError::InternalError { message, file, line } => {
                assert!(message.contains("Test error"));
                assert!(file.ends_with("mod.rs"));
                assert!(line > 0);
            }
            _ => panic!("Wrong error type"),
        }
    }
}
