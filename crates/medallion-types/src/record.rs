//! Ordered column → value mapping.

use crate::schema::Schema;
use crate::value::Value;

static NULL: Value = Value::Null;

/// A row: column names in insertion order with their values.
///
/// Lookups of absent columns yield [`Value::Null`], which is how rows
/// written before a schema gained a column are read back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Value of `column`, or `Null` when absent.
    #[must_use]
    pub fn get(&self, column: &str) -> &Value {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map_or(&NULL, |(_, value)| value)
    }

    #[must_use]
    pub fn contains(&self, column: &str) -> bool {
        self.fields.iter().any(|(name, _)| name == column)
    }

    /// Set `column`, replacing an existing value in place or appending.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(name, _)| *name == column) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((column, value)),
        }
    }

    /// Builder-style [`Record::insert`].
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// Reorder to `schema`, filling missing columns with `Null` and
    /// dropping columns the schema does not know.
    #[must_use]
    pub fn project(&self, schema: &Schema) -> Self {
        Self {
            fields: schema
                .names()
                .map(|name| (name.to_string(), self.get(name).clone()))
                .collect(),
        }
    }

    /// JSON object encoding (column order is not preserved by `serde_json::Map`).
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
        )
    }

    /// Decode a JSON object written by [`Record::to_json`] against `schema`.
    /// Keys unknown to the schema are skipped.
    #[must_use]
    pub fn from_json(json: &serde_json::Map<String, serde_json::Value>, schema: &Schema) -> Self {
        let mut record = Self::with_capacity(schema.len());
        for column in schema.columns() {
            if let Some(cell) = json.get(&column.name) {
                record.insert(
                    column.name.clone(),
                    Value::from_json(cell, column.column_type),
                );
            }
        }
        record
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Self::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, ColumnType};

    #[test]
    fn absent_column_reads_null() {
        let r = Record::new().with("id", 1_i64);
        assert_eq!(r.get("id"), &Value::Integer(1));
        assert!(r.get("town").is_null());
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut r = Record::new().with("a", 1_i64).with("b", 2_i64);
        r.insert("a", 10_i64);
        assert_eq!(r.columns().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(r.get("a"), &Value::Integer(10));
    }

    #[test]
    fn project_fills_nulls_in_schema_order() {
        let schema = Schema::from_columns([
            ColumnSchema::new("town", ColumnType::String),
            ColumnSchema::new("id", ColumnType::Integer),
        ]);
        let r = Record::new().with("id", 7_i64).with("extra", "x");
        let p = r.project(&schema);
        assert_eq!(p.columns().collect::<Vec<_>>(), vec!["town", "id"]);
        assert!(p.get("town").is_null());
        assert!(!p.contains("extra"));
    }

    #[test]
    fn json_roundtrip_through_schema() {
        let schema = Schema::from_columns([
            ColumnSchema::new("id", ColumnType::Integer),
            ColumnSchema::new("premium", ColumnType::Float),
        ]);
        let r = Record::new().with("id", 1_i64).with("premium", 12.5);
        let json = r.to_json();
        let back = Record::from_json(json.as_object().unwrap(), &schema);
        assert_eq!(back, r);
    }
}
