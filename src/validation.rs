//! Validation
//!
//! Two unrelated checks live here:
//!
//! - identifier validation for names and labels registered through the SQL
//!   API, before they ever reach generated DDL;
//! - the dependency validator, which compares declared dependencies with
//!   the table names found in a view's SQL and suggests a corrected list.
//!
//! The dependency validator is advisory: it only produces warnings.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::catalog::{ModelEntry, TableCatalog};
use crate::config::MAX_IDENTIFIER_LEN;
use crate::error::{ViewGraphError, ViewGraphResult};
use crate::registry::ViewRegistry;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("identifier pattern is valid")
});

/// Validate a relation name, optionally schema-qualified (`schema.table`)
///
/// Only unquoted PostgreSQL identifier characters are accepted, so names can
/// be interpolated into generated SQL and trigger names.
pub fn validate_sql_identifier(identifier: &str, param_name: &str) -> ViewGraphResult<()> {
    let invalid = |reason: &str| ViewGraphError::InvalidIdentifier {
        parameter: param_name.to_string(),
        value: identifier.to_string(),
        reason: reason.to_string(),
    };

    if identifier.is_empty() {
        return Err(invalid("Identifier cannot be empty"));
    }

    let parts: Vec<&str> = identifier.split('.').collect();
    if parts.len() > 2 {
        return Err(invalid("At most one schema qualifier is allowed"));
    }

    for part in parts {
        if part.len() > MAX_IDENTIFIER_LEN {
            return Err(invalid("Identifier too long (max 63 characters)"));
        }
        if !IDENTIFIER.is_match(part) {
            return Err(invalid(
                "Identifier must start with a letter or underscore and contain only letters, digits, '_' or '$'",
            ));
        }
    }

    Ok(())
}

/// Validate a model label: `app.Model` or a bare table name
pub fn validate_label(label: &str, param_name: &str) -> ViewGraphResult<()> {
    validate_sql_identifier(label, param_name)
}

/// A view whose SQL mentions tables it does not declare
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationWarning {
    pub view: String,
    pub missing: Vec<String>,
    /// Declared dependencies plus the missing labels, sorted and de-duplicated
    pub suggested: Vec<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let suggested: Vec<String> = self.suggested.iter().map(|l| format!("'{l}'")).collect();
        write!(
            f,
            "{} dependencies might be missing the following models: {}. \
             The correct dependency list might be:\n    dependencies = [{}]",
            self.view,
            self.missing.join(", "),
            suggested.join(", ")
        )
    }
}

/// Whole-word matcher for one catalog table
struct TableMatcher<'a> {
    entry: &'a ModelEntry,
    pattern: Regex,
}

fn table_matchers<'a>(catalog: &'a TableCatalog) -> ViewGraphResult<Vec<TableMatcher<'a>>> {
    catalog
        .entries()
        .map(|entry| -> ViewGraphResult<TableMatcher<'a>> {
            let pattern = Regex::new(&format!(
                r"(?:^|[^_a-zA-Z0-9]){}(?:[^_a-zA-Z0-9]|$)",
                regex::escape(&entry.db_table)
            ))?;
            Ok(TableMatcher { entry, pattern })
        })
        .collect()
}

/// Compare every view's SQL with its declared dependencies.
///
/// A catalog table found in the SQL as a whole word, other than the view
/// itself, must be declared either by label or by table name.
pub fn validate_dependencies(registry: &ViewRegistry, catalog: &TableCatalog) -> ViewGraphResult<Vec<ValidationWarning>> {
    let matchers = table_matchers(catalog)?;
    let mut warnings = Vec::new();

    for view in registry.iter() {
        let sql = view.body.sql();
        let mut missing: Vec<String> = Vec::new();

        for matcher in &matchers {
            let entry = matcher.entry;
            if entry.db_table == view.name || !matcher.pattern.is_match(sql) {
                continue;
            }
            let declared = view
                .dependencies
                .iter()
                .any(|d| d.eq_ignore_ascii_case(&entry.label) || *d == entry.db_table);
            if !declared && !missing.contains(&entry.label) {
                missing.push(entry.label.clone());
            }
        }

        if !missing.is_empty() {
            let suggested: BTreeSet<String> = view
                .dependencies
                .iter()
                .cloned()
                .chain(missing.iter().cloned())
                .collect();
            warnings.push(ValidationWarning {
                view: view.label.clone(),
                missing,
                suggested: suggested.into_iter().collect(),
            });
        }
    }

    Ok(warnings)
}
