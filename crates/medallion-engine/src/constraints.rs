//! Row-level data-quality expectations.
//!
//! A [`Constraint`] pairs a name and a three-valued predicate with the
//! policy applied to records that violate it. Evaluation is a pure function
//! of the record, the constraints, and the [`EvalContext`]; every constraint
//! is checked even after an earlier one failed so counts are complete.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use medallion_types::state::{TableName, ViolationPolicy, ViolationRecord};
use medallion_types::Record;

use crate::config::types::{ExpectationConfig, NullHandling};
use crate::errors::PipelineError;
use crate::expr::{EvalContext, Expr, ExpressionError, Truth};

/// Predicate closure over a record.
pub type Predicate = Arc<dyn Fn(&Record, &EvalContext) -> Truth + Send + Sync>;

/// A named expectation.
#[derive(Clone)]
pub struct Constraint {
    name: String,
    predicate: Predicate,
    policy: ViolationPolicy,
    on_null: NullHandling,
    /// Expression text, when built from one.
    expression: Option<String>,
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constraint")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("on_null", &self.on_null)
            .field("expression", &self.expression)
            .finish_non_exhaustive()
    }
}

impl Constraint {
    /// Constraint from an arbitrary predicate. Unknown results are
    /// violations unless [`Constraint::with_null_handling`] says otherwise.
    pub fn new<F>(name: impl Into<String>, policy: ViolationPolicy, predicate: F) -> Self
    where
        F: Fn(&Record, &EvalContext) -> Truth + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
            policy,
            on_null: NullHandling::default(),
            expression: None,
        }
    }

    /// Compile an expression into a constraint.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError`] if `expression` does not parse.
    pub fn from_expression(
        name: impl Into<String>,
        expression: &str,
        policy: ViolationPolicy,
    ) -> Result<Self, ExpressionError> {
        let expr = Expr::parse(expression)?;
        let mut constraint = Self::new(name, policy, move |record, ctx| expr.truth(record, ctx));
        constraint.expression = Some(expression.to_string());
        Ok(constraint)
    }

    /// Build from a table's `expectations:` entry.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError`] if the expectation does not parse.
    pub fn from_config(config: &ExpectationConfig) -> Result<Self, ExpressionError> {
        Ok(
            Self::from_expression(&config.name, &config.expect, config.on_violation)?
                .with_null_handling(config.on_null),
        )
    }

    #[must_use]
    pub fn with_null_handling(mut self, on_null: NullHandling) -> Self {
        self.on_null = on_null;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn policy(&self) -> ViolationPolicy {
        self.policy
    }

    /// `None` when satisfied, otherwise why not.
    fn violation(&self, record: &Record, ctx: &EvalContext) -> Option<String> {
        let subject = match &self.expression {
            Some(e) => format!("expectation '{}' ({e})", self.name),
            None => format!("expectation '{}'", self.name),
        };
        match (self.predicate)(record, ctx) {
            Truth::True => None,
            Truth::False => Some(format!("{subject} evaluated to false")),
            Truth::Unknown => match self.on_null {
                NullHandling::Pass => None,
                NullHandling::Violate => Some(format!("{subject} evaluated to null")),
            },
        }
    }
}

/// Overall outcome for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Verdict {
    Pass,
    Warned,
    Dropped,
    Failed,
}

impl Verdict {
    fn from_policy(policy: ViolationPolicy) -> Self {
        match policy {
            ViolationPolicy::Warn => Self::Warned,
            ViolationPolicy::Drop => Self::Dropped,
            ViolationPolicy::Fail => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub constraint: String,
    pub policy: ViolationPolicy,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub verdict: Verdict,
    pub violations: Vec<Violation>,
}

/// Evaluate every constraint against `record`, in order.
///
/// The verdict is the most severe policy among violated constraints
/// (`Failed > Dropped > Warned > Pass`).
#[must_use]
pub fn evaluate(record: &Record, constraints: &[Constraint], ctx: &EvalContext) -> Evaluation {
    let mut verdict = Verdict::Pass;
    let mut violations = Vec::new();
    for constraint in constraints {
        if let Some(message) = constraint.violation(record, ctx) {
            verdict = verdict.max(Verdict::from_policy(constraint.policy));
            violations.push(Violation {
                constraint: constraint.name.clone(),
                policy: constraint.policy,
                message,
            });
        }
    }
    Evaluation {
        verdict,
        violations,
    }
}

/// A record excluded from the output, with every violation it had.
#[derive(Debug, Clone)]
pub struct RejectedRow {
    pub record: Record,
    pub verdict: Verdict,
    pub violations: Vec<Violation>,
}

/// Result of evaluating a batch.
#[derive(Debug, Default)]
pub struct BatchEvaluation {
    /// Rows that passed or only warned, in input order.
    pub kept: Vec<Record>,
    /// Rows dropped or failed, in input order.
    pub rejected: Vec<RejectedRow>,
    pub warned: u64,
    /// Violations per constraint name, any policy.
    pub counts: BTreeMap<String, u64>,
    /// Violations per `fail` constraint.
    failed: BTreeMap<String, u64>,
}

impl BatchEvaluation {
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.rejected
            .iter()
            .filter(|r| r.verdict == Verdict::Dropped)
            .count() as u64
    }

    /// Error for the first `fail` constraint (by name) that was violated.
    #[must_use]
    pub fn failure(&self, table: &str) -> Option<PipelineError> {
        self.failed
            .iter()
            .next()
            .map(|(constraint, &violations)| PipelineError::ConstraintFailed {
                table: table.to_string(),
                constraint: constraint.clone(),
                violations,
            })
    }

    /// Violation records for every rejected row, one per violated
    /// constraint.
    #[must_use]
    pub fn violation_records(&self, table: &TableName, occurred_at: &str) -> Vec<ViolationRecord> {
        self.rejected
            .iter()
            .flat_map(|row| {
                let record_json = row.record.to_json().to_string();
                row.violations.iter().map(move |v| ViolationRecord {
                    table: table.clone(),
                    constraint: v.constraint.clone(),
                    policy: v.policy,
                    record_json: record_json.clone(),
                    message: v.message.clone(),
                    occurred_at: occurred_at.to_string(),
                })
            })
            .collect()
    }
}

/// Evaluate `rows` against `constraints`.
///
/// Never short-circuits: a `fail` violation is recorded and evaluation
/// continues so the counts cover the whole batch. Callers turn
/// [`BatchEvaluation::failure`] into an error after persisting the
/// rejected rows.
#[must_use]
pub fn evaluate_batch(
    table: &str,
    rows: Vec<Record>,
    constraints: &[Constraint],
    ctx: &EvalContext,
) -> BatchEvaluation {
    let mut out = BatchEvaluation {
        kept: Vec::with_capacity(rows.len()),
        ..BatchEvaluation::default()
    };
    if constraints.is_empty() {
        out.kept = rows;
        return out;
    }

    for record in rows {
        let evaluation = evaluate(&record, constraints, ctx);
        for v in &evaluation.violations {
            *out.counts.entry(v.constraint.clone()).or_insert(0) += 1;
            if v.policy == ViolationPolicy::Fail {
                *out.failed.entry(v.constraint.clone()).or_insert(0) += 1;
            }
        }
        match evaluation.verdict {
            Verdict::Pass => out.kept.push(record),
            Verdict::Warned => {
                out.warned += 1;
                out.kept.push(record);
            }
            Verdict::Dropped | Verdict::Failed => out.rejected.push(RejectedRow {
                record,
                verdict: evaluation.verdict,
                violations: evaluation.violations,
            }),
        }
    }

    for constraint in constraints {
        let Some(&violations) = out.counts.get(constraint.name()) else {
            continue;
        };
        match constraint.policy {
            ViolationPolicy::Warn => tracing::warn!(
                table,
                constraint = constraint.name(),
                violations,
                "Expectation violated, records kept"
            ),
            ViolationPolicy::Drop => tracing::info!(
                table,
                constraint = constraint.name(),
                violations,
                "Expectation violated, records dropped"
            ),
            ViolationPolicy::Fail => tracing::error!(
                table,
                constraint = constraint.name(),
                violations,
                "Expectation violated, failing trigger"
            ),
        }
    }
    out
}
