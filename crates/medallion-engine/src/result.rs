//! Pipeline execution result types.

use medallion_types::error::ErrorCategory;
use medallion_types::state::{RunRecord, RunStats, StageState, TriggerOutcome};
use medallion_types::Schema;

use crate::config::types::TableKind;

/// How one stage ended within a pipeline trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage ran and committed.
    Completed(TriggerOutcome),
    /// Nothing new upstream; no run was recorded.
    Skipped,
    /// Not run because `upstream` failed or is blocked.
    Blocked { upstream: String },
    /// Failed in an earlier trigger and not yet reset.
    AwaitingReset { reason: Option<String> },
    Failed {
        category: ErrorCategory,
        message: String,
    },
}

impl StageOutcome {
    /// Outcome recorded in run history, if the stage ran.
    #[must_use]
    pub fn trigger_outcome(&self) -> Option<TriggerOutcome> {
        match self {
            Self::Completed(outcome) => Some(*outcome),
            Self::Failed { .. } => Some(TriggerOutcome::Failure),
            Self::Skipped | Self::Blocked { .. } | Self::AwaitingReset { .. } => None,
        }
    }

    /// `true` when descendants must not run.
    #[must_use]
    pub fn halts_descendants(&self) -> bool {
        matches!(
            self,
            Self::Failed { .. } | Self::Blocked { .. } | Self::AwaitingReset { .. }
        )
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed(outcome) => outcome.as_str(),
            Self::Skipped => "skipped",
            Self::Blocked { .. } => "blocked",
            Self::AwaitingReset { .. } => "awaiting_reset",
            Self::Failed { .. } => "failure",
        }
    }
}

/// Result of one stage within a pipeline trigger.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub table: String,
    pub kind: TableKind,
    pub outcome: StageOutcome,
    pub stats: RunStats,
    /// Run history ID, `None` when the stage did not run.
    pub run_id: Option<i64>,
    pub retry_count: u32,
    pub duration_secs: f64,
}

impl StageReport {
    pub(crate) fn not_run(table: &str, kind: TableKind, outcome: StageOutcome) -> Self {
        Self {
            table: table.to_string(),
            kind,
            outcome,
            stats: RunStats::default(),
            run_id: None,
            retry_count: 0,
            duration_secs: 0.0,
        }
    }
}

/// Aggregate record counts across every stage of a trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineCounts {
    pub records_in: u64,
    pub records_out: u64,
    pub records_dropped: u64,
    pub records_warned: u64,
    pub parse_errors: u64,
    pub files_processed: u64,
}

/// Result of one pipeline trigger, stages in execution order.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub pipeline: String,
    pub stages: Vec<StageReport>,
    pub duration_secs: f64,
    pub retry_count: u32,
    pub parallelism: u32,
}

impl PipelineReport {
    #[must_use]
    pub fn stage(&self, table: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.table == table)
    }

    /// Stages that failed in this trigger.
    pub fn failed(&self) -> impl Iterator<Item = &StageReport> {
        self.stages
            .iter()
            .filter(|s| matches!(s.outcome, StageOutcome::Failed { .. }))
    }

    #[must_use]
    pub fn counts(&self) -> PipelineCounts {
        self.stages
            .iter()
            .fold(PipelineCounts::default(), |mut acc, s| {
                acc.records_in += s.stats.records_in;
                acc.records_out += s.stats.records_out;
                acc.records_dropped += s.stats.records_dropped;
                acc.records_warned += s.stats.records_warned;
                acc.parse_errors += s.stats.parse_errors;
                acc.files_processed += s.stats.files_processed;
                acc
            })
    }

    /// Worst outcome across stages. Blocked stages and stages awaiting
    /// reset count as failures; a trigger where every stage was skipped is
    /// a success.
    #[must_use]
    pub fn outcome(&self) -> TriggerOutcome {
        let mut outcome = TriggerOutcome::Success;
        for stage in &self.stages {
            match &stage.outcome {
                StageOutcome::Failed { .. }
                | StageOutcome::Blocked { .. }
                | StageOutcome::AwaitingReset { .. } => {
                    return TriggerOutcome::Failure;
                }
                StageOutcome::Completed(TriggerOutcome::PartialSuccess) => {
                    outcome = TriggerOutcome::PartialSuccess;
                }
                StageOutcome::Completed(_) | StageOutcome::Skipped => {}
            }
        }
        outcome
    }
}

/// Result of a pipeline check.
#[derive(Debug)]
pub struct CheckResult {
    /// Tables grouped by execution level.
    pub levels: Vec<Vec<String>>,
    pub sources: Vec<SourceCheck>,
    pub state_ok: bool,
}

impl CheckResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.state_ok && self.sources.iter().all(|s| s.error.is_none())
    }
}

/// Reachability of one streaming source directory.
#[derive(Debug)]
pub struct SourceCheck {
    pub table: String,
    pub path: String,
    pub pending_files: usize,
    pub error: Option<String>,
}

/// Persisted view of one table, for operators.
#[derive(Debug, Clone)]
pub struct TableStatus {
    pub table: String,
    pub kind: TableKind,
    /// `None` if the stage never ran.
    pub stage: Option<StageState>,
    pub last_run: Option<RunRecord>,
    /// Row count of the current snapshot, `None` if never committed.
    pub rows: Option<usize>,
    pub version: u64,
    /// Schema recorded in the state store at the last commit.
    pub schema: Option<Schema>,
    /// Violations per constraint across all runs.
    pub violations: Vec<(String, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(table: &str, outcome: StageOutcome, dropped: u64) -> StageReport {
        let mut report = StageReport::not_run(table, TableKind::Joined, outcome);
        report.stats.records_dropped = dropped;
        report.stats.records_in = 10;
        report
    }

    fn report(stages: Vec<StageReport>) -> PipelineReport {
        PipelineReport {
            pipeline: "premiums".into(),
            stages,
            duration_secs: 0.0,
            retry_count: 0,
            parallelism: 1,
        }
    }

    #[test]
    fn outcome_is_worst_stage() {
        let ok = report(vec![
            stage("a", StageOutcome::Completed(TriggerOutcome::Success), 0),
            stage("b", StageOutcome::Skipped, 0),
        ]);
        assert_eq!(ok.outcome(), TriggerOutcome::Success);

        let partial = report(vec![
            stage("a", StageOutcome::Completed(TriggerOutcome::Success), 0),
            stage("b", StageOutcome::Completed(TriggerOutcome::PartialSuccess), 2),
        ]);
        assert_eq!(partial.outcome(), TriggerOutcome::PartialSuccess);
        assert_eq!(partial.counts().records_dropped, 2);
        assert_eq!(partial.counts().records_in, 20);

        let blocked = report(vec![stage(
            "c",
            StageOutcome::Blocked {
                upstream: "b".into(),
            },
            0,
        )]);
        assert_eq!(blocked.outcome(), TriggerOutcome::Failure);
        assert_eq!(blocked.failed().count(), 0);
    }

    #[test]
    fn only_ran_stages_have_trigger_outcomes() {
        assert_eq!(StageOutcome::Skipped.trigger_outcome(), None);
        assert_eq!(
            StageOutcome::Failed {
                category: ErrorCategory::Constraint,
                message: "x".into()
            }
            .trigger_outcome(),
            Some(TriggerOutcome::Failure)
        );
        assert!(!StageOutcome::Skipped.halts_descendants());
        assert!(StageOutcome::Blocked {
            upstream: "a".into()
        }
        .halts_descendants());
    }
}
