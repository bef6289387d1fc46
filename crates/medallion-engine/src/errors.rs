//! Pipeline error model and retry backoff policy helpers.

use std::path::PathBuf;
use std::time::Duration;

use medallion_state::StateError;
use medallion_types::error::{ErrorCategory, SchemaEvolutionError};

use crate::expr::ExpressionError;

const BACKOFF_MAX_MS: u64 = 60_000;

// ---------------------------------------------------------------------------
// PipelineError: categorised errors for retry decisions
// ---------------------------------------------------------------------------

/// Error that aborts a stage trigger.
///
/// Only [`PipelineError::Io`] is retried; every other variant fails the
/// stage until an operator resets it.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Incoming schema rejected by the table's evolution policy.
    #[error("table '{table}': {source}")]
    SchemaEvolution {
        table: String,
        #[source]
        source: SchemaEvolutionError,
    },

    /// A `fail` expectation was violated.
    #[error("table '{table}': expectation '{constraint}' failed for {violations} record(s)")]
    ConstraintFailed {
        table: String,
        constraint: String,
        violations: u64,
    },

    /// Storage unreachable or unreadable.
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// State backend failure.
    #[error("state backend: {0}")]
    State(#[from] StateError),

    /// Expression could not be compiled.
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    /// Table definition inconsistent with the data it reads.
    #[error("table '{table}': {message}")]
    Config { table: String, message: String },

    /// Host-side failure (task join, encoding) that is never retried.
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn config(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Returns `true` for transient storage errors worth another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    /// Broad classification persisted with the failed run.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::SchemaEvolution { .. } => ErrorCategory::SchemaEvolution,
            Self::ConstraintFailed { .. } => ErrorCategory::Constraint,
            Self::Io { .. } => ErrorCategory::Io,
            Self::State(_) => ErrorCategory::State,
            Self::Expression(_) | Self::Config { .. } => ErrorCategory::Config,
            Self::Infrastructure(_) => ErrorCategory::Internal,
        }
    }
}

/// Exponential retry delay: `base * 2^(attempt-1)`, capped at 60s.
pub(crate) fn compute_backoff(base_ms: u64, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    let delay_ms = base_ms.saturating_mul(factor);
    Duration::from_millis(delay_ms.min(BACKOFF_MAX_MS))
}
