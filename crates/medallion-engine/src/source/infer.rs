//! Per-cell type inference and per-file schema widening.

use chrono::NaiveDate;
use medallion_types::value::DATE_FORMAT;
use medallion_types::{ColumnSchema, ColumnType, Record, Schema, Value};

/// Interpret one text cell. Empty (or whitespace-only) cells are null.
///
/// With `infer` off every non-empty cell stays a string.
pub fn infer_text(raw: &str, infer: bool) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if !infer {
        return Value::String(raw.to_string());
    }
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Boolean(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Boolean(false);
    }
    if let Ok(v) = trimmed.parse::<i64>() {
        return Value::Integer(v);
    }
    if looks_numeric(trimmed) {
        if let Ok(v) = trimmed.parse::<f64>() {
            if v.is_finite() {
                return Value::Float(v);
            }
        }
    }
    if let Some(d) = parse_date(trimmed) {
        return Value::Date(d);
    }
    Value::String(raw.to_string())
}

/// Interpret one JSON cell. Native JSON types are kept; strings are only
/// promoted to dates when `infer` is on. Nested values are stored as their
/// JSON text.
pub fn infer_json(cell: &serde_json::Value, infer: bool) -> Value {
    match cell {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Value::Integer)
            .or_else(|| n.as_f64().map(Value::Float))
            .unwrap_or(Value::Null),
        serde_json::Value::String(s) => match infer.then(|| parse_date(s)).flatten() {
            Some(d) => Value::Date(d),
            None => Value::String(s.clone()),
        },
        nested => Value::String(nested.to_string()),
    }
}

/// Rejects words `f64::from_str` would accept (`inf`, `NaN`).
fn looks_numeric(s: &str) -> bool {
    s.bytes().any(|b| b.is_ascii_digit())
        && s
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E'))
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    if s.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(s, DATE_FORMAT).ok()
}

/// Column types observed across one file, in first-seen order.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    columns: Vec<(String, Option<ColumnType>)>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a column even if every value turns out null.
    pub fn declare(&mut self, name: &str) {
        if !self.columns.iter().any(|(n, _)| n == name) {
            self.columns.push((name.to_string(), None));
        }
    }

    pub fn observe(&mut self, name: &str, value: &Value) {
        let observed = value.column_type();
        match self.columns.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => {
                *slot = match (*slot, observed) {
                    (current, None) => current,
                    (None, Some(t)) => Some(t),
                    (Some(a), Some(b)) => Some(a.widen(b).unwrap_or(ColumnType::String)),
                };
            }
            None => self.columns.push((name.to_string(), observed)),
        }
    }

    /// Final schema. All-null columns are placeholders.
    pub fn finish(self) -> Schema {
        Schema::from_columns(self.columns.into_iter().map(|(name, t)| match t {
            Some(t) => ColumnSchema::new(name, t),
            None => ColumnSchema::placeholder(name),
        }))
    }
}

/// Rewrite `record` so every value has its column's schema type.
pub fn conform(record: &mut Record, schema: &Schema) {
    let updates: Vec<(String, Value)> = record
        .iter()
        .filter_map(|(name, value)| {
            let target = schema.column_type(name)?;
            match value.column_type() {
                Some(t) if t != target => Some((
                    name.to_string(),
                    value.coerce_to(target).unwrap_or(Value::Null),
                )),
                _ => None,
            }
        })
        .collect();
    for (name, value) in updates {
        record.insert(name, value);
    }
}
