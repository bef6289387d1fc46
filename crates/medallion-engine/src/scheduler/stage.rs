//! One stage trigger: change detection, execution with retries, and the
//! run/status bookkeeping around it.

use std::sync::Arc;
use std::time::Instant;

use medallion_state::StateBackend;
use medallion_types::schema::SchemaEvolutionPolicy;
use medallion_types::state::{CursorState, PipelineId, RunStats, StageStatus, TableName};

use crate::bronze::BronzeIngestor;
use crate::config::types::{RefreshMode, TableConfig, TableKind};
use crate::errors::{compute_backoff, PipelineError};
use crate::expr::EvalContext;
use crate::gold::{aggregate, AggregateSpec};
use crate::result::{StageOutcome, StageReport};
use crate::silver::{transform, SilverSpec, TransformOutput};
use crate::source::infer::conform;
use crate::source::SourceWatcher;
use crate::table::{TableSnapshot, TableStore, WriteMode};

const PRIMARY_OFFSET: &str = "primary_offset";
const PRIMARY_VERSION: &str = "primary_version";
const PRIMARY_EPOCH: &str = "primary_epoch";
const REFERENCE_VERSION: &str = "reference_version";
const INPUT_VERSION: &str = "input_version";

/// Everything a stage needs, shared with blocking tasks.
pub(crate) struct StageContext {
    pub(crate) pipeline: PipelineId,
    pub(crate) config: TableConfig,
    pub(crate) table: TableName,
    pub(crate) state: Arc<dyn StateBackend>,
    pub(crate) store: Arc<TableStore>,
    pub(crate) ctx: EvalContext,
    pub(crate) partitions: usize,
    pub(crate) max_retries: u32,
    pub(crate) retry_backoff_ms: u64,
    pub(crate) full_refresh: bool,
}

impl StageContext {
    fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }

    fn cursor(&self, key: &str) -> Result<Option<u64>, PipelineError> {
        Ok(self
            .state
            .get_cursor(&self.pipeline, &self.table, key)?
            .and_then(|c| c.cursor_value)
            .and_then(|v| v.parse().ok()))
    }

    fn set_cursor(&self, key: &str, value: u64) -> Result<(), PipelineError> {
        let cursor = CursorState {
            cursor_field: Some(key.to_string()),
            cursor_value: Some(value.to_string()),
            updated_at: Self::now(),
        };
        self.state
            .set_cursor(&self.pipeline, &self.table, key, &cursor)?;
        Ok(())
    }

    /// `true` if `version` differs from the one recorded under `key`.
    fn advanced(&self, key: &str, version: u64) -> Result<bool, PipelineError> {
        Ok(self.cursor(key)?.unwrap_or(0) != version)
    }

    fn upstream(
        &self,
        name: Option<&str>,
        role: &str,
    ) -> Result<Arc<TableSnapshot>, PipelineError> {
        let name = name.ok_or_else(|| {
            PipelineError::config(self.table.as_str(), format!("missing '{role}' table"))
        })?;
        Ok(self.store.snapshot_or_empty(&TableName::new(name)))
    }

    fn watcher(&self) -> Result<SourceWatcher, PipelineError> {
        let source = self.config.source.clone().ok_or_else(|| {
            PipelineError::config(self.table.as_str(), "streaming table has no source")
        })?;
        Ok(SourceWatcher::new(
            self.pipeline.clone(),
            self.table.clone(),
            source,
            Arc::clone(&self.state),
        ))
    }

    /// Whether upstream has anything this stage has not consumed yet.
    pub(crate) fn has_new_data(&self) -> Result<bool, PipelineError> {
        if self.full_refresh {
            return Ok(true);
        }
        match self.config.kind {
            TableKind::Streaming => Ok(!self.watcher()?.pending()?.is_empty()),
            TableKind::Joined => {
                let primary = self.upstream(self.config.primary.as_deref(), "primary")?;
                if self.advanced(PRIMARY_VERSION, primary.version())? {
                    return Ok(true);
                }
                if self.config.refresh == RefreshMode::Incremental {
                    return Ok(false);
                }
                match self.config.reference.as_deref() {
                    Some(name) => {
                        let reference = self.upstream(Some(name), "reference")?;
                        self.advanced(REFERENCE_VERSION, reference.version())
                    }
                    None => Ok(false),
                }
            }
            TableKind::Aggregate => {
                let input = self.upstream(self.config.from.as_deref(), "from")?;
                self.advanced(INPUT_VERSION, input.version())
            }
        }
    }

    fn begin(&self) -> Result<i64, PipelineError> {
        self.state
            .set_stage_status(&self.pipeline, &self.table, StageStatus::Running, None)?;
        Ok(self.state.start_run(&self.pipeline, &self.table)?)
    }

    pub(crate) fn execute(&self, run_id: i64) -> Result<RunStats, PipelineError> {
        match self.config.kind {
            TableKind::Streaming => self.run_streaming(),
            TableKind::Joined => self.run_joined(run_id),
            TableKind::Aggregate => self.run_aggregate(),
        }
    }

    fn run_streaming(&self) -> Result<RunStats, PipelineError> {
        let watcher = self.watcher()?;
        let (batch, current, mode) = if self.full_refresh {
            (
                watcher.rescan()?,
                Arc::new(TableSnapshot::empty(self.table.clone())),
                WriteMode::Replace,
            )
        } else {
            (
                watcher.poll()?,
                self.store.snapshot_or_empty(&self.table),
                WriteMode::Append,
            )
        };

        let ingestor = BronzeIngestor::new(self.table.clone(), self.config.schema_evolution);
        let bronze = ingestor.ingest(&current, &batch.files)?;
        let records_out = bronze.rows.len() as u64;

        self.store
            .commit(&self.table, bronze.schema.clone(), bronze.rows, mode)?;
        self.state
            .set_schema(&self.pipeline, &self.table, &bronze.schema)?;
        // Only after the commit, so a crash re-reads rather than loses files.
        self.state
            .mark_files_processed(&self.pipeline, &self.table, &batch.watermark_entries())?;

        Ok(RunStats {
            records_in: batch.record_count(),
            records_out,
            parse_errors: bronze.parse_errors,
            files_processed: batch.files.len() as u64,
            ..RunStats::default()
        })
    }

    fn run_joined(&self, run_id: i64) -> Result<RunStats, PipelineError> {
        let spec = SilverSpec::from_config(&self.config)?;
        let primary = self.upstream(self.config.primary.as_deref(), "primary")?;
        let reference = match self.config.reference.as_deref() {
            Some(name) => Some(self.upstream(Some(name), "reference")?),
            None => None,
        };
        let current = self.store.snapshot_or_empty(&self.table);

        let offset =
            usize::try_from(self.cursor(PRIMARY_OFFSET)?.unwrap_or(0)).unwrap_or(usize::MAX);
        let rebuild = self.full_refresh
            || self.config.refresh == RefreshMode::Full
            || current.version() == 0
            || self.advanced(PRIMARY_EPOCH, primary.epoch())?
            || offset > primary.len();
        let input = if rebuild {
            primary.rows()
        } else {
            primary.rows_from(offset)
        };

        let TransformOutput {
            schema,
            evaluation,
            joined,
        } = transform(input, primary.schema(), reference.as_deref(), &spec, &self.ctx)?;

        let violations = evaluation.violation_records(&self.table, &Self::now());
        if let Some(err) = evaluation.failure(self.table.as_str()) {
            self.state
                .insert_violations(&self.pipeline, run_id, &violations)?;
            return Err(err);
        }

        let stats = RunStats {
            records_in: input.len() as u64,
            records_out: evaluation.kept.len() as u64,
            records_dropped: evaluation.dropped(),
            records_warned: evaluation.warned,
            ..RunStats::default()
        };

        let (schema, rows, mode) = if rebuild {
            (schema, evaluation.kept, WriteMode::Replace)
        } else {
            let mut merged = current.schema().clone();
            merged
                .merge(&schema, SchemaEvolutionPolicy::default())
                .map_err(|source| PipelineError::SchemaEvolution {
                    table: self.table.to_string(),
                    source,
                })?;
            let mut rows = evaluation.kept;
            for row in &mut rows {
                conform(row, &merged);
            }
            (merged, rows, WriteMode::Append)
        };

        tracing::debug!(
            pipeline = %self.pipeline,
            table = %self.table,
            rebuild,
            input = input.len(),
            joined,
            "Joined batch ready"
        );

        self.store.commit(&self.table, schema.clone(), rows, mode)?;
        self.state.set_schema(&self.pipeline, &self.table, &schema)?;
        self.set_cursor(PRIMARY_OFFSET, primary.len() as u64)?;
        self.set_cursor(PRIMARY_VERSION, primary.version())?;
        self.set_cursor(PRIMARY_EPOCH, primary.epoch())?;
        if let Some(reference) = &reference {
            self.set_cursor(REFERENCE_VERSION, reference.version())?;
        }
        if !violations.is_empty() {
            self.state
                .insert_violations(&self.pipeline, run_id, &violations)?;
        }
        Ok(stats)
    }

    fn run_aggregate(&self) -> Result<RunStats, PipelineError> {
        let spec = AggregateSpec::from_config(&self.config);
        let input = self.upstream(self.config.from.as_deref(), "from")?;
        let output = aggregate(&input, &spec, self.partitions)?;
        let records_out = output.rows.len() as u64;

        self.store
            .commit(&self.table, output.schema.clone(), output.rows, WriteMode::Replace)?;
        self.state
            .set_schema(&self.pipeline, &self.table, &output.schema)?;
        self.set_cursor(INPUT_VERSION, input.version())?;

        Ok(RunStats {
            records_in: input.len() as u64,
            records_out,
            ..RunStats::default()
        })
    }

    fn finish(
        &self,
        run_id: i64,
        outcome: &StageOutcome,
        stats: &RunStats,
    ) -> Result<(), PipelineError> {
        let recorded = outcome
            .trigger_outcome()
            .unwrap_or_else(|| stats.completed_outcome());
        self.state.complete_run(run_id, recorded, stats)?;
        match outcome {
            StageOutcome::Failed { message, .. } => self.state.set_stage_status(
                &self.pipeline,
                &self.table,
                StageStatus::Failed,
                Some(message),
            )?,
            _ => self.state.set_stage_status(
                &self.pipeline,
                &self.table,
                StageStatus::Succeeded,
                None,
            )?,
        }
        Ok(())
    }
}

/// Run `op` on the blocking pool.
async fn blocking<T, F>(
    stage: &Arc<StageContext>,
    what: &'static str,
    op: F,
) -> Result<T, PipelineError>
where
    F: FnOnce(&StageContext) -> Result<T, PipelineError> + Send + 'static,
    T: Send + 'static,
{
    let stage = Arc::clone(stage);
    tokio::task::spawn_blocking(move || op(stage.as_ref()))
        .await
        .map_err(|e| {
            PipelineError::Infrastructure(anyhow::anyhow!("{what} task panicked: {e}"))
        })?
}

/// Run `op`, retrying retryable errors with exponential backoff. Returns
/// the final result and the number of retries spent.
async fn with_retries<T, F>(
    stage: &Arc<StageContext>,
    what: &'static str,
    op: F,
) -> (Result<T, PipelineError>, u32)
where
    F: Fn(&StageContext) -> Result<T, PipelineError> + Clone + Send + 'static,
    T: Send + 'static,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match blocking(stage, what, op.clone()).await {
            Err(err) if err.is_retryable() && attempt <= stage.max_retries => {
                let delay = compute_backoff(stage.retry_backoff_ms, attempt);
                #[allow(clippy::cast_possible_truncation)]
                // Safety: the backoff is capped well under u64::MAX millis
                let delay_ms = delay.as_millis() as u64;
                tracing::warn!(
                    pipeline = %stage.pipeline,
                    table = %stage.table,
                    attempt,
                    max_retries = stage.max_retries,
                    delay_ms,
                    error = %err,
                    "Retryable error, will retry"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                if err.is_retryable() {
                    tracing::error!(
                        pipeline = %stage.pipeline,
                        table = %stage.table,
                        attempt,
                        max_retries = stage.max_retries,
                        "Max retries exhausted, failing stage"
                    );
                }
                return (Err(err), attempt - 1);
            }
            Ok(value) => return (Ok(value), attempt - 1),
        }
    }
}

fn failed(err: &PipelineError) -> StageOutcome {
    StageOutcome::Failed {
        category: err.category(),
        message: err.to_string(),
    }
}

/// Trigger one stage. Never returns an error: failures are reported in
/// the [`StageReport`] and persisted as a failed run.
pub(crate) async fn run_stage(stage: Arc<StageContext>) -> StageReport {
    let start = Instant::now();
    let name = stage.config.name.clone();
    let kind = stage.config.kind;

    let (detected, mut retry_count) =
        with_retries(&stage, "change detection", StageContext::has_new_data).await;
    if let Ok(false) = detected {
        tracing::debug!(pipeline = %stage.pipeline, table = %name, "No new upstream data");
        return StageReport::not_run(&name, kind, StageOutcome::Skipped);
    }

    let run_id = match blocking(&stage, "start_run", StageContext::begin).await {
        Ok(id) => id,
        Err(err) => {
            tracing::error!(
                pipeline = %stage.pipeline,
                table = %name,
                error = %err,
                "Failed to start run"
            );
            return StageReport::not_run(&name, kind, failed(&err));
        }
    };
    tracing::info!(
        pipeline = %stage.pipeline,
        table = %name,
        kind = kind.as_str(),
        run_id,
        full_refresh = stage.full_refresh,
        "Stage triggered"
    );

    let result = match detected {
        Err(err) => Err(err),
        Ok(_) => {
            let (result, retries) =
                with_retries(&stage, "stage", move |s: &StageContext| s.execute(run_id)).await;
            retry_count += retries;
            result
        }
    };

    let (mut outcome, mut stats) = match result {
        Ok(stats) => (StageOutcome::Completed(stats.completed_outcome()), stats),
        Err(err) => {
            tracing::error!(
                pipeline = %stage.pipeline,
                table = %name,
                category = %err.category(),
                error = %err,
                "Stage failed"
            );
            let stats = RunStats {
                error_category: Some(err.category()),
                error_message: Some(err.to_string()),
                ..RunStats::default()
            };
            (failed(&err), stats)
        }
    };

    let (final_outcome, final_stats) = (outcome.clone(), stats.clone());
    if let Err(err) = blocking(&stage, "complete_run", move |s| {
        s.finish(run_id, &final_outcome, &final_stats)
    })
    .await
    {
        tracing::error!(
            pipeline = %stage.pipeline,
            table = %name,
            error = %err,
            "Failed to record run"
        );
        stats.error_category = Some(err.category());
        stats.error_message = Some(err.to_string());
        outcome = failed(&err);
    }

    let duration_secs = start.elapsed().as_secs_f64();
    if let StageOutcome::Completed(trigger) = &outcome {
        tracing::info!(
            pipeline = %stage.pipeline,
            table = %name,
            outcome = %trigger,
            records_in = stats.records_in,
            records_out = stats.records_out,
            records_dropped = stats.records_dropped,
            parse_errors = stats.parse_errors,
            duration_secs,
            "Stage completed"
        );
    }

    StageReport {
        table: name,
        kind,
        outcome,
        stats,
        run_id: Some(run_id),
        retry_count,
        duration_secs,
    }
}
