//! Hashable, totally ordered keys built from cell values.

use chrono::NaiveDate;
use medallion_types::Value;

/// One component of a join or grouping key.
///
/// Integers and integral floats that compare equal share a key. The
/// derived ordering is total but only meaningful within one variant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Date(NaiveDate),
    Str(String),
}

/// Largest float magnitude converted to an integer key without loss.
const MAX_EXACT_FLOAT: f64 = 9_007_199_254_740_992.0;

impl KeyPart {
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Integer(i) => Self::Int(*i),
            Value::Float(f) if f.fract() == 0.0 && f.abs() <= MAX_EXACT_FLOAT => {
                Self::Int(*f as i64)
            }
            Value::Float(f) => Self::Float(f.to_bits()),
            Value::String(s) => Self::Str(s.clone()),
            Value::Date(d) => Self::Date(*d),
            Value::Boolean(b) => Self::Bool(*b),
        }
    }

    /// Key for equi-joins, where null never matches.
    pub(crate) fn join(value: &Value) -> Option<Self> {
        match Self::of(value) {
            Self::Null => None,
            key => Some(key),
        }
    }
}
