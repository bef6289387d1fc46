//! Error classification shared across crates.
//!
//! Record-level problems ([`ParseError`]) are absorbed and counted;
//! batch-level problems ([`SchemaEvolutionError`], constraint failures,
//! exhausted I/O retries) abort the current trigger.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::schema::ColumnType;

/// Broad classification of a pipeline error, persisted with run history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed source record.
    Parse,
    /// Incompatible schema change.
    SchemaEvolution,
    /// Row-level expectation violated.
    Constraint,
    /// Storage unreachable or unreadable (retryable).
    Io,
    /// State backend failure.
    State,
    /// Invalid pipeline configuration.
    Config,
    /// Bug or unexpected condition.
    Internal,
}

impl ErrorCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::SchemaEvolution => "schema_evolution",
            Self::Constraint => "constraint",
            Self::Io => "io",
            Self::State => "state",
            Self::Config => "config",
            Self::Internal => "internal",
        }
    }

    /// Inverse of [`ErrorCategory::as_str`].
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "parse" => Self::Parse,
            "schema_evolution" => Self::SchemaEvolution,
            "constraint" => Self::Constraint,
            "io" => Self::Io,
            "state" => Self::State,
            "config" => Self::Config,
            "internal" => Self::Internal,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A source record that could not be parsed. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseError {
    /// File the record came from.
    pub file: String,
    /// 1-based line number, when known.
    pub line: Option<u64>,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}: {}", self.file, line, self.message),
            None => write!(f, "{}: {}", self.file, self.message),
        }
    }
}

impl std::error::Error for ParseError {}

/// A schema change rejected by the table's evolution policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaEvolutionError {
    #[error("column '{column}' cannot change type from {existing} to {incoming}")]
    IncompatibleType {
        column: String,
        existing: ColumnType,
        incoming: ColumnType,
    },
    #[error("new column '{column}' rejected by schema evolution policy")]
    NewColumnRejected { column: String },
}

impl SchemaEvolutionError {
    #[must_use]
    pub fn column(&self) -> &str {
        match self {
            Self::IncompatibleType { column, .. } | Self::NewColumnRejected { column } => column,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_display_is_snake_case() {
        assert_eq!(ErrorCategory::SchemaEvolution.to_string(), "schema_evolution");
        let json = serde_json::to_string(&ErrorCategory::Io).unwrap();
        assert_eq!(json, "\"io\"");
    }

    #[test]
    fn parse_error_display_includes_location() {
        let err = ParseError {
            file: "premiums/part-1.csv".into(),
            line: Some(4),
            message: "expected 6 fields, found 3".into(),
        };
        assert_eq!(
            err.to_string(),
            "premiums/part-1.csv:4: expected 6 fields, found 3"
        );
    }

    #[test]
    fn schema_error_names_column() {
        let err = SchemaEvolutionError::IncompatibleType {
            column: "birthdate".into(),
            existing: ColumnType::Date,
            incoming: ColumnType::Integer,
        };
        assert_eq!(err.column(), "birthdate");
        assert!(err.to_string().contains("from date to integer"));
    }
}
