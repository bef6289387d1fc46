//! State backend model types.
//!
//! Pure data types used by `StateBackend` implementations. Kept in the
//! types crate so both the engine and the state crate can share them
//! without circular dependencies.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCategory;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque pipeline identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(String);

impl PipelineId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for PipelineId {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// Name of a table, which is also the name of the stage producing it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableName(String);

impl TableName {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for TableName {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

impl std::borrow::Borrow<str> for TableName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Stage lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of a stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Idle,
    Running,
    Failed,
    Succeeded,
}

impl StageStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Succeeded => "succeeded",
        }
    }

    /// Parse the storage string. Unknown strings map to `None`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "failed" => Some(Self::Failed),
            "succeeded" => Some(Self::Succeeded),
            _ => None,
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted status of a stage plus the reason for its last failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// ISO-8601 UTC timestamp of the last transition.
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Run tracking
// ---------------------------------------------------------------------------

/// Completion signal of one stage trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// Trigger still in progress.
    Running,
    Success,
    /// Completed, but rows were dropped or files had unparseable records.
    PartialSuccess,
    Failure,
}

impl TriggerOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Failure => "failure",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "partial_success" => Some(Self::PartialSuccess),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

impl std::fmt::Display for TriggerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate statistics for one stage trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub records_in: u64,
    pub records_out: u64,
    pub records_dropped: u64,
    pub records_warned: u64,
    pub parse_errors: u64,
    pub files_processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl RunStats {
    /// Outcome implied by these stats for a trigger that did not fail.
    #[must_use]
    pub fn completed_outcome(&self) -> TriggerOutcome {
        if self.records_dropped > 0 || self.parse_errors > 0 {
            TriggerOutcome::PartialSuccess
        } else {
            TriggerOutcome::Success
        }
    }
}

/// A persisted stage run as read back from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: i64,
    pub table: TableName,
    pub outcome: TriggerOutcome,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub stats: RunStats,
}

// ---------------------------------------------------------------------------
// Watermarks and cursors
// ---------------------------------------------------------------------------

/// A source file already consumed by a watcher.
///
/// Identity is the path plus size and modification time, so a file that is
/// rewritten in place is treated as new.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessedFile {
    pub path: String,
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch.
    pub modified_ms: i64,
    pub records: u64,
    pub parse_errors: u64,
}

/// Snapshot of a persisted progress cursor for a (pipeline, key) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    /// What the value measures (e.g. `"row_offset"`, `"table_version"`).
    pub cursor_field: Option<String>,
    pub cursor_value: Option<String>,
    /// ISO-8601 UTC timestamp of when this cursor was last written.
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Data quality
// ---------------------------------------------------------------------------

/// What happens to a record that violates a constraint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationPolicy {
    /// Keep the record and log the violation.
    #[default]
    Warn,
    /// Exclude the record from the output.
    Drop,
    /// Abort the whole trigger.
    Fail,
}

impl ViolationPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warn => "warn",
            Self::Drop => "drop",
            Self::Fail => "fail",
        }
    }
}

impl std::fmt::Display for ViolationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record excluded (or flagged) by a constraint, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub table: TableName,
    pub constraint: String,
    pub policy: ViolationPolicy,
    pub record_json: String,
    pub message: String,
    /// ISO-8601 UTC timestamp.
    pub occurred_at: String,
}
