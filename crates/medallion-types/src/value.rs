//! Typed cell values.
//!
//! [`Value`] is the unit of data flowing through every stage. Comparison
//! follows SQL semantics: any comparison involving `Null` is unknown
//! (`None`), and integers compare numerically against floats.

use std::cmp::Ordering;
use std::fmt;

use chrono::NaiveDate;

use crate::schema::ColumnType;

/// `YYYY-MM-DD`, the only date layout accepted on input and emitted on output.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A single typed cell.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Float(f64),
    String(String),
    Date(NaiveDate),
    Boolean(bool),
}

impl Value {
    /// Semantic type of this value, `None` for `Null`.
    #[must_use]
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Self::Null => None,
            Self::Integer(_) => Some(ColumnType::Integer),
            Self::Float(_) => Some(ColumnType::Float),
            Self::String(_) => Some(ColumnType::String),
            Self::Date(_) => Some(ColumnType::Date),
            Self::Boolean(_) => Some(ColumnType::Boolean),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view used by arithmetic and aggregates.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// SQL-style ordering. `None` when either side is null or the types
    /// are not comparable.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => None,
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Integer(_) | Self::Float(_), Self::Integer(_) | Self::Float(_)) => {
                self.as_f64()?.partial_cmp(&other.as_f64()?)
            }
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Date(a), Self::Date(b)) => Some(a.cmp(b)),
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Convert to `target`, returning `None` when no lossless or widening
    /// conversion exists. Every value converts to `String`.
    #[must_use]
    pub fn coerce_to(&self, target: ColumnType) -> Option<Self> {
        match (self, target) {
            (Self::Null, _) => Some(Self::Null),
            (Self::Integer(v), ColumnType::Integer) => Some(Self::Integer(*v)),
            #[allow(clippy::cast_precision_loss)]
            (Self::Integer(v), ColumnType::Float) => Some(Self::Float(*v as f64)),
            (Self::Float(v), ColumnType::Float) => Some(Self::Float(*v)),
            (Self::Date(d), ColumnType::Date) => Some(Self::Date(*d)),
            (Self::Boolean(b), ColumnType::Boolean) => Some(Self::Boolean(*b)),
            (Self::String(s), ColumnType::String) => Some(Self::String(s.clone())),
            (other, ColumnType::String) => Some(Self::String(other.to_string())),
            _ => None,
        }
    }

    /// JSON encoding used for storage parts and violation records.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Integer(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Date(d) => serde_json::Value::String(d.format(DATE_FORMAT).to_string()),
            Self::Boolean(b) => serde_json::Value::Bool(*b),
        }
    }

    /// Decode a JSON cell written by [`Value::to_json`], guided by the
    /// column's schema type. Cells that do not fit the type decode as `Null`.
    #[must_use]
    pub fn from_json(json: &serde_json::Value, column_type: ColumnType) -> Self {
        match (json, column_type) {
            (serde_json::Value::Null, _) => Self::Null,
            (serde_json::Value::Number(n), ColumnType::Integer) => {
                n.as_i64().map_or(Self::Null, Self::Integer)
            }
            (serde_json::Value::Number(n), ColumnType::Float) => {
                n.as_f64().map_or(Self::Null, Self::Float)
            }
            (serde_json::Value::String(s), ColumnType::Date) => {
                NaiveDate::parse_from_str(s, DATE_FORMAT).map_or(Self::Null, Self::Date)
            }
            (serde_json::Value::String(s), ColumnType::String) => Self::String(s.clone()),
            (serde_json::Value::Bool(b), ColumnType::Boolean) => Self::Boolean(*b),
            (other, ColumnType::String) => Self::String(other.to_string()),
            _ => Self::Null,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => f.write_str(s),
            Self::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
            Self::Boolean(b) => write!(f, "{b}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}
