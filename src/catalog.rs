use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// One logical entity of the model registry: a label such as `app.Order`
/// bound to the relation that stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub label: String,
    pub db_table: String,
    /// Field name -> column name; fields missing here use their own name
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl ModelEntry {
    pub fn new(label: impl Into<String>, db_table: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            db_table: db_table.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>, column: impl Into<String>) -> Self {
        self.fields.insert(field.into(), column.into());
        self
    }

    pub fn column_for<'a>(&'a self, field: &'a str) -> &'a str {
        self.fields.get(field).map_or(field, String::as_str)
    }
}

/// Table catalog handed to the resolver.
///
/// Holds every known relation (base tables and the views themselves) keyed
/// by label and by table name. Entries keep their insertion order.
#[derive(Debug, Clone, Default)]
pub struct TableCatalog {
    entries: Vec<ModelEntry>,
    by_label: HashMap<String, usize>,
    by_table: HashMap<String, usize>,
}

impl TableCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. A later entry for an already known table replaces the
    /// earlier one, so explicit registrations can override introspection.
    pub fn insert(&mut self, entry: ModelEntry) {
        if let Some(&idx) = self.by_table.get(&entry.db_table) {
            self.by_label.remove(&normalize_label(&self.entries[idx].label));
            self.by_label.insert(normalize_label(&entry.label), idx);
            self.entries[idx] = entry;
            return;
        }
        let idx = self.entries.len();
        self.by_label.insert(normalize_label(&entry.label), idx);
        self.by_table.insert(entry.db_table.clone(), idx);
        self.entries.push(entry);
    }

    pub fn with(mut self, entry: ModelEntry) -> Self {
        self.insert(entry);
        self
    }

    /// Look up `app.Model`; the model part is case-insensitive
    pub fn by_label(&self, label: &str) -> Option<&ModelEntry> {
        self.by_label.get(&normalize_label(label)).map(|&idx| &self.entries[idx])
    }

    pub fn by_table(&self, table: &str) -> Option<&ModelEntry> {
        self.by_table.get(table).map(|&idx| &self.entries[idx])
    }

    pub fn entries(&self) -> impl Iterator<Item = &ModelEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize_label(label: &str) -> String {
    match label.split_once('.') {
        Some((app, model)) => format!("{}.{}", app, model.to_lowercase()),
        None => label.to_string(),
    }
}

/// Quote an identifier for generated SQL.
///
/// Schema-qualified names are quoted part by part; already quoted parts are
/// left alone.
pub fn quote_name(name: &str) -> String {
    name.split('.')
        .map(|part| {
            if part.len() >= 2 && part.starts_with('"') && part.ends_with('"') {
                part.to_string()
            } else {
                format!("\"{}\"", part.replace('"', "\"\""))
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_lookup_ignores_model_case() {
        let catalog = TableCatalog::new().with(ModelEntry::new("app.Order", "app_order"));

        assert_eq!(catalog.by_label("app.order").map(|e| e.db_table.as_str()), Some("app_order"));
        assert_eq!(catalog.by_label("app.Order").map(|e| e.db_table.as_str()), Some("app_order"));
        assert!(catalog.by_label("other.Order").is_none());
        assert!(catalog.by_table("app_order").is_some());
    }

    #[test]
    fn test_insert_replaces_same_table() {
        let mut catalog = TableCatalog::new();
        catalog.insert(ModelEntry::new("public.app_order", "app_order"));
        catalog.insert(ModelEntry::new("app.Order", "app_order"));

        assert_eq!(catalog.len(), 1);
        assert!(catalog.by_label("public.app_order").is_none());
        assert_eq!(catalog.by_table("app_order").map(|e| e.label.as_str()), Some("app.Order"));
    }

    #[test]
    fn test_column_for_falls_back_to_field_name() {
        let entry = ModelEntry::new("app.Totals", "mv_order_totals").with_field("order", "order_id");
        assert_eq!(entry.column_for("order"), "order_id");
        assert_eq!(entry.column_for("total"), "total");
    }

    #[test]
    fn test_quote_name() {
        assert_eq!(quote_name("orders"), "\"orders\"");
        assert_eq!(quote_name("sales.orders"), "\"sales\".\"orders\"");
        assert_eq!(quote_name("\"Orders\""), "\"Orders\"");
        assert_eq!(quote_name("we\"ird"), "\"we\"\"ird\"");
    }
}
