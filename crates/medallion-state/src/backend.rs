//! State backend trait definition.
//!
//! [`StateBackend`] defines the storage contract for source watermarks,
//! stage cursors, stage status, run history, table schemas, and violation
//! records. Model types live in [`medallion_types::state`].

use medallion_types::schema::Schema;
use medallion_types::state::{
    CursorState, PipelineId, ProcessedFile, RunRecord, RunStats, StageState, StageStatus,
    TableName, TriggerOutcome, ViolationRecord,
};

use crate::error;

/// Storage contract for pipeline state.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateBackend>`.
pub trait StateBackend: Send + Sync {
    // ── Source watermarks ───────────────────────────────────────────

    /// All files recorded as consumed by the watcher feeding `table`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn processed_files(
        &self,
        pipeline: &PipelineId,
        table: &TableName,
    ) -> error::Result<Vec<ProcessedFile>>;

    /// Record files as consumed. All-or-nothing; re-marking a file with the
    /// same identity is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn mark_files_processed(
        &self,
        pipeline: &PipelineId,
        table: &TableName,
        files: &[ProcessedFile],
    ) -> error::Result<()>;

    // ── Stage cursors ───────────────────────────────────────────────

    /// Read the cursor named `key` for a (pipeline, table) pair.
    ///
    /// Returns `Ok(None)` when no cursor has been persisted yet.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_cursor(
        &self,
        pipeline: &PipelineId,
        table: &TableName,
        key: &str,
    ) -> error::Result<Option<CursorState>>;

    /// Upsert the cursor named `key` for a (pipeline, table) pair.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn set_cursor(
        &self,
        pipeline: &PipelineId,
        table: &TableName,
        key: &str,
        cursor: &CursorState,
    ) -> error::Result<()>;

    // ── Schemas ─────────────────────────────────────────────────────

    /// Last committed schema of `table`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage or
    /// decoding failure.
    fn get_schema(&self, pipeline: &PipelineId, table: &TableName)
        -> error::Result<Option<Schema>>;

    /// Persist the schema of `table`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage or
    /// encoding failure.
    fn set_schema(
        &self,
        pipeline: &PipelineId,
        table: &TableName,
        schema: &Schema,
    ) -> error::Result<()>;

    // ── Stage status ────────────────────────────────────────────────

    /// Current status of the stage producing `table`, `None` if never run.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_stage_status(
        &self,
        pipeline: &PipelineId,
        table: &TableName,
    ) -> error::Result<Option<StageState>>;

    /// Transition the stage producing `table`. `reason` is kept for `Failed`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn set_stage_status(
        &self,
        pipeline: &PipelineId,
        table: &TableName,
        status: StageStatus,
        reason: Option<&str>,
    ) -> error::Result<()>;

    /// Remove cursors, watermarks, and the stored schema of `table` so the
    /// next trigger rebuilds it from scratch. Run history is kept.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn clear_table_state(&self, pipeline: &PipelineId, table: &TableName) -> error::Result<()>;

    // ── Runs ────────────────────────────────────────────────────────

    /// Begin a new stage run, returning its unique ID.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn start_run(&self, pipeline: &PipelineId, table: &TableName) -> error::Result<i64>;

    /// Finalize a stage run with its outcome and aggregate stats.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn complete_run(
        &self,
        run_id: i64,
        outcome: TriggerOutcome,
        stats: &RunStats,
    ) -> error::Result<()>;

    /// Most recent runs, newest first, optionally filtered to one table.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_runs(
        &self,
        pipeline: &PipelineId,
        table: Option<&TableName>,
        limit: usize,
    ) -> error::Result<Vec<RunRecord>>;

    // ── Violations ──────────────────────────────────────────────────

    /// Persist constraint violation records. Returns the count inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn insert_violations(
        &self,
        pipeline: &PipelineId,
        run_id: i64,
        records: &[ViolationRecord],
    ) -> error::Result<u64>;

    /// Total violations per constraint for `table`, ordered by constraint name.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn violation_counts(
        &self,
        pipeline: &PipelineId,
        table: &TableName,
    ) -> error::Result<Vec<(String, u64)>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify the trait is object-safe (can be used as `dyn StateBackend`).
    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn StateBackend) {}
    }
}
