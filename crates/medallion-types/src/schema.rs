//! Column types, table schemas, and schema evolution policies.
//!
//! A [`Schema`] is an arena of known columns plus a version counter. Every
//! structural change (new column, widened type) bumps the version so
//! readers can tell whether a snapshot's schema moved under them.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SchemaEvolutionError;

/// Semantic type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    String,
    Date,
    Boolean,
}

impl ColumnType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Date => "date",
            Self::Boolean => "boolean",
        }
    }

    /// Least common type both sides widen to without loss, if any.
    ///
    /// Only `Integer → Float` is an implicit widening; every other pair of
    /// distinct types is a conflict the evolution policy must resolve.
    #[must_use]
    pub fn widen(self, other: Self) -> Option<Self> {
        match (self, other) {
            (a, b) if a == b => Some(a),
            (Self::Integer, Self::Float) | (Self::Float, Self::Integer) => Some(Self::Float),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Evolution policies ──────────────────────────────────────────────

/// How to handle columns that appear for the first time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnPolicy {
    /// Add the column to the schema; earlier rows read it as null.
    #[default]
    Add,
    /// Keep the schema unchanged and drop the column's values.
    Ignore,
    /// Reject the batch.
    Fail,
}

/// How to handle a column whose incoming type conflicts with the known type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeChangePolicy {
    /// Widen the column to `string`.
    #[default]
    Coerce,
    /// Keep the known type and null values that do not fit it.
    Null,
    /// Reject the batch.
    Fail,
}

/// Schema evolution behavior applied when a batch is merged into a table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEvolutionPolicy {
    #[serde(default)]
    pub new_column: ColumnPolicy,
    #[serde(default)]
    pub type_change: TypeChangePolicy,
}

// ── Schema ──────────────────────────────────────────────────────────

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
    /// Only nulls seen so far. The type reads as `string` until the first
    /// non-null value replaces it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub placeholder: bool,
}

impl ColumnSchema {
    #[must_use]
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            placeholder: false,
        }
    }

    /// Column known by name only.
    #[must_use]
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self {
            placeholder: true,
            ..Self::new(name, ColumnType::String)
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SchemaRepr {
    columns: Vec<ColumnSchema>,
    version: u64,
}

/// Ordered column arena with a change counter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "SchemaRepr", into = "SchemaRepr")]
pub struct Schema {
    columns: Vec<ColumnSchema>,
    index: HashMap<String, usize>,
    version: u64,
}

impl From<SchemaRepr> for Schema {
    fn from(repr: SchemaRepr) -> Self {
        let mut schema = Self::from_columns(repr.columns);
        schema.version = repr.version;
        schema
    }
}

impl From<Schema> for SchemaRepr {
    fn from(schema: Schema) -> Self {
        Self {
            columns: schema.columns,
            version: schema.version,
        }
    }
}

/// Outcome of merging an incoming schema into a table schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaMerge {
    /// Columns appended to the schema.
    pub added: Vec<String>,
    /// Columns whose type was widened (name, from, to).
    pub widened: Vec<(String, ColumnType, ColumnType)>,
    /// Incoming columns left out under `new_column: ignore`.
    pub ignored: Vec<String>,
    /// Columns whose conflicting incoming values will be nulled.
    pub nulled: Vec<String>,
    /// Placeholder columns that received their first real type.
    pub typed: Vec<(String, ColumnType)>,
}

impl SchemaMerge {
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.widened.is_empty() && self.typed.is_empty()
    }
}

impl Schema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a schema from columns. Later duplicates of a name are dropped.
    #[must_use]
    pub fn from_columns(columns: impl IntoIterator<Item = ColumnSchema>) -> Self {
        let mut schema = Self::new();
        for column in columns {
            if !schema.index.contains_key(&column.name) {
                schema.index.insert(column.name.clone(), schema.columns.len());
                schema.columns.push(column);
            }
        }
        schema
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Number of structural changes applied since creation.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ColumnSchema> {
        self.index.get(name).map(|&i| &self.columns[i])
    }

    #[must_use]
    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.get(name).map(|c| c.column_type)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// `true` if `name` exists but has only ever held nulls.
    #[must_use]
    pub fn is_placeholder(&self, name: &str) -> bool {
        self.get(name).is_some_and(|c| c.placeholder)
    }

    /// `true` if some column of `self` has a different type in `other`.
    #[must_use]
    pub fn retyped_in(&self, other: &Schema) -> bool {
        self.columns.iter().any(|c| {
            other
                .column_type(&c.name)
                .is_some_and(|t| t != c.column_type)
        })
    }

    fn push_column(&mut self, column: ColumnSchema) {
        self.index.insert(column.name.clone(), self.columns.len());
        self.columns.push(column);
        self.version += 1;
    }

    fn set_type(&mut self, name: &str, column_type: ColumnType) {
        if let Some(&i) = self.index.get(name) {
            self.columns[i].column_type = column_type;
            self.columns[i].placeholder = false;
            self.version += 1;
        }
    }

    /// Append a column, or widen an existing one when the types are
    /// compatible. A placeholder column takes `column_type` as is.
    /// Conflicting types leave the schema untouched and return `false`.
    pub fn upsert_column(&mut self, name: &str, column_type: ColumnType) -> bool {
        match self.index.get(name).copied() {
            Some(i) if self.columns[i].placeholder => {
                self.set_type(name, column_type);
                true
            }
            Some(i) => {
                let existing = self.columns[i].column_type;
                match existing.widen(column_type) {
                    Some(widened) if widened == existing => true,
                    Some(widened) => {
                        self.columns[i].column_type = widened;
                        self.version += 1;
                        true
                    }
                    None => false,
                }
            }
            None => {
                self.push_column(ColumnSchema::new(name, column_type));
                true
            }
        }
    }

    /// Merge `incoming` into this schema under `policy`.
    ///
    /// The first merge into an empty schema always adds every column.
    /// Placeholder columns never conflict: an incoming placeholder leaves
    /// the known type alone, and a known placeholder takes the incoming
    /// type.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaEvolutionError`] when a new column or a type conflict
    /// is rejected by the policy. The schema is left unchanged in that case.
    pub fn merge(
        &mut self,
        incoming: &Schema,
        policy: SchemaEvolutionPolicy,
    ) -> Result<SchemaMerge, SchemaEvolutionError> {
        let bootstrap = self.is_empty();
        let mut next = self.clone();
        let mut outcome = SchemaMerge::default();

        for column in incoming.columns() {
            match next.column_type(&column.name) {
                None => {
                    if !bootstrap {
                        match policy.new_column {
                            ColumnPolicy::Add => {}
                            ColumnPolicy::Ignore => {
                                outcome.ignored.push(column.name.clone());
                                continue;
                            }
                            ColumnPolicy::Fail => {
                                return Err(SchemaEvolutionError::NewColumnRejected {
                                    column: column.name.clone(),
                                });
                            }
                        }
                    }
                    next.push_column(column.clone());
                    outcome.added.push(column.name.clone());
                }
                Some(_) if column.placeholder => {}
                Some(_) if next.is_placeholder(&column.name) => {
                    next.set_type(&column.name, column.column_type);
                    outcome
                        .typed
                        .push((column.name.clone(), column.column_type));
                }
                Some(existing) => match existing.widen(column.column_type) {
                    Some(widened) if widened == existing => {}
                    Some(widened) => {
                        next.upsert_column(&column.name, widened);
                        outcome
                            .widened
                            .push((column.name.clone(), existing, widened));
                    }
                    None => match policy.type_change {
                        TypeChangePolicy::Coerce => {
                            if existing != ColumnType::String {
                                next.set_type(&column.name, ColumnType::String);
                                outcome.widened.push((
                                    column.name.clone(),
                                    existing,
                                    ColumnType::String,
                                ));
                            }
                        }
                        TypeChangePolicy::Null => outcome.nulled.push(column.name.clone()),
                        TypeChangePolicy::Fail => {
                            return Err(SchemaEvolutionError::IncompatibleType {
                                column: column.name.clone(),
                                existing,
                                incoming: column.column_type,
                            });
                        }
                    },
                },
            }
        }

        *self = next;
        Ok(outcome)
    }
}
