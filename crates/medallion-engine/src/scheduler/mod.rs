//! Pipeline scheduler: runs stages level by level over the table DAG.
//!
//! Stages in one level only read tables committed by earlier levels, so
//! they run concurrently (bounded by `resources.parallelism`) as tasks in
//! a [`JoinSet`], with their file and CPU work on the blocking pool. A
//! stage whose upstream failed, is blocked, or awaits reset in this
//! trigger is reported as blocked and not run.
//!
//! Every stage is a small persisted state machine: `idle` or `succeeded`
//! moves to `running` when upstream has new data, then to `succeeded` or
//! `failed`. A failed stage stays failed across triggers until
//! [`Pipeline::reset`] returns it to `idle`.

mod stage;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use medallion_state::{SqliteStateBackend, StateBackend};
use medallion_types::state::{PipelineId, StageState, StageStatus, TableName};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::config::types::{PipelineConfig, StateBackendKind, TableConfig, TableKind};
use crate::dag::Dag;
use crate::errors::PipelineError;
use crate::expr::EvalContext;
use crate::result::{
    CheckResult, PipelineReport, SourceCheck, StageOutcome, StageReport, TableStatus,
};
use crate::source::SourceWatcher;
use crate::table::TableStore;

use self::stage::{run_stage, StageContext};

/// A configured pipeline bound to its state backend and table store.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    id: PipelineId,
    dag: Dag,
    state: Arc<dyn StateBackend>,
    store: Arc<TableStore>,
    ctx: EvalContext,
}

impl Pipeline {
    /// Bind `config` to an explicit backend and store.
    ///
    /// `current_date()` evaluates to `processing_date` from the config, or
    /// today (UTC) when unset.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] if the table graph has unknown
    /// dependencies or cycles.
    pub fn new(
        config: PipelineConfig,
        state: Arc<dyn StateBackend>,
        store: TableStore,
    ) -> Result<Self, PipelineError> {
        let dag = Dag::build(
            config
                .tables
                .iter()
                .map(|t| (t.name.as_str(), t.dependencies())),
        )
        .map_err(|errors| {
            let message = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            PipelineError::config(config.pipeline.as_str(), message)
        })?;

        let processing_date = config
            .processing_date
            .unwrap_or_else(|| chrono::Utc::now().date_naive());
        Ok(Self {
            id: PipelineId::new(config.pipeline.clone()),
            config: Arc::new(config),
            dag,
            state,
            store: Arc::new(store),
            ctx: EvalContext::new(processing_date),
        })
    }

    /// Open the state backend and table store named by the config.
    /// Either falls back to memory when its location is unset.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::State`] or [`PipelineError::Io`] if either
    /// cannot be opened, or any error of [`Pipeline::new`].
    pub fn open(config: PipelineConfig) -> Result<Self, PipelineError> {
        let state: Arc<dyn StateBackend> = match config.state.backend {
            StateBackendKind::Sqlite => match &config.state.connection {
                Some(path) => Arc::new(SqliteStateBackend::open(std::path::Path::new(path))?),
                None => Arc::new(SqliteStateBackend::in_memory()?),
            },
        };
        let store = match &config.storage.path {
            Some(root) => TableStore::open(root)?,
            None => TableStore::in_memory(),
        };
        Self::new(config, state, store)
    }

    /// Override the date `current_date()` evaluates to.
    #[must_use]
    pub fn with_processing_date(mut self, date: NaiveDate) -> Self {
        self.ctx = EvalContext::new(date);
        self
    }

    #[must_use]
    pub fn processing_date(&self) -> NaiveDate {
        self.ctx.processing_date
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn id(&self) -> &PipelineId {
        &self.id
    }

    #[must_use]
    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    #[must_use]
    pub fn state(&self) -> &Arc<dyn StateBackend> {
        &self.state
    }

    #[must_use]
    pub fn store(&self) -> &TableStore {
        &self.store
    }

    fn parallelism(&self) -> usize {
        usize::try_from(self.config.resources.parallelism)
            .unwrap_or(1)
            .max(1)
    }

    fn stage_context(&self, table: &TableConfig, full_refresh: bool) -> StageContext {
        StageContext {
            pipeline: self.id.clone(),
            config: table.clone(),
            table: TableName::new(table.name.clone()),
            state: Arc::clone(&self.state),
            store: Arc::clone(&self.store),
            ctx: self.ctx,
            partitions: self.parallelism(),
            max_retries: self.config.resources.max_retries,
            retry_backoff_ms: self.config.resources.retry_backoff_ms,
            full_refresh,
        }
    }

    /// Persisted status of every stage, read once per trigger.
    async fn stage_states(&self) -> Result<HashMap<String, StageState>, PipelineError> {
        let state = Arc::clone(&self.state);
        let id = self.id.clone();
        let names: Vec<String> = self.config.tables.iter().map(|t| t.name.clone()).collect();
        tokio::task::spawn_blocking(move || {
            let mut out = HashMap::new();
            for name in names {
                if let Some(s) = state.get_stage_status(&id, &TableName::new(name.clone()))? {
                    out.insert(name, s);
                }
            }
            Ok::<_, PipelineError>(out)
        })
        .await
        .map_err(|e| {
            PipelineError::Infrastructure(anyhow::anyhow!("stage status task panicked: {e}"))
        })?
    }

    /// First direct upstream of `table` that halted in this trigger.
    fn halted_upstream(&self, table: &str, done: &[StageReport]) -> Option<String> {
        self.dag
            .upstream(table)
            .iter()
            .find(|up| {
                done.iter()
                    .any(|s| s.table == **up && s.outcome.halts_descendants())
            })
            .cloned()
    }

    /// Trigger every stage once, in dependency order.
    ///
    /// Each stage reads the upstream snapshots committed at the moment it
    /// starts. With `full_refresh` every stage rebuilds its table from
    /// scratch instead of consuming only new data.
    ///
    /// Stage failures are reported in the returned [`PipelineReport`] and
    /// persisted; they are not errors of this call.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::State`] if stage status cannot be read and
    /// [`PipelineError::Infrastructure`] if a stage task panics.
    pub async fn run_once(&self, full_refresh: bool) -> Result<PipelineReport, PipelineError> {
        let start = Instant::now();
        let parallelism = self.parallelism();
        tracing::info!(
            pipeline = %self.id,
            processing_date = %self.ctx.processing_date,
            full_refresh,
            parallelism,
            "Starting pipeline trigger"
        );

        let persisted = self.stage_states().await?;
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let mut stages: Vec<StageReport> = Vec::with_capacity(self.config.tables.len());

        for level in self.dag.levels() {
            let mut slots: Vec<Option<StageReport>> = vec![None; level.len()];
            let mut join_set: JoinSet<(usize, StageReport)> = JoinSet::new();

            for (idx, name) in level.iter().enumerate() {
                let Some(table) = self.config.table(name) else {
                    continue;
                };
                if let Some(upstream) = self.halted_upstream(name, &stages) {
                    tracing::warn!(
                        pipeline = %self.id,
                        table = %name,
                        upstream = %upstream,
                        "Upstream halted, stage blocked"
                    );
                    slots[idx] = Some(StageReport::not_run(
                        name,
                        table.kind,
                        StageOutcome::Blocked { upstream },
                    ));
                    continue;
                }
                if let Some(failed) = persisted
                    .get(name)
                    .filter(|s| s.status == StageStatus::Failed)
                {
                    tracing::warn!(
                        pipeline = %self.id,
                        table = %name,
                        reason = failed.reason.as_deref(),
                        "Stage failed in an earlier trigger, awaiting reset"
                    );
                    slots[idx] = Some(StageReport::not_run(
                        name,
                        table.kind,
                        StageOutcome::AwaitingReset {
                            reason: failed.reason.clone(),
                        },
                    ));
                    continue;
                }

                let permit = Arc::clone(&semaphore).acquire_owned().await.map_err(|e| {
                    PipelineError::Infrastructure(anyhow::anyhow!("Semaphore closed: {e}"))
                })?;
                let stage = Arc::new(self.stage_context(table, full_refresh));
                join_set.spawn(async move {
                    let _permit = permit;
                    (idx, run_stage(stage).await)
                });
            }

            while let Some(joined) = join_set.join_next().await {
                let (idx, report) = joined.map_err(|e| {
                    PipelineError::Infrastructure(anyhow::anyhow!("Stage task panicked: {e}"))
                })?;
                slots[idx] = Some(report);
            }
            stages.extend(slots.into_iter().flatten());
        }

        let report = PipelineReport {
            pipeline: self.config.pipeline.clone(),
            retry_count: stages.iter().map(|s| s.retry_count).sum(),
            stages,
            duration_secs: start.elapsed().as_secs_f64(),
            parallelism: self.config.resources.parallelism,
        };
        let counts = report.counts();
        tracing::info!(
            pipeline = %self.id,
            outcome = %report.outcome(),
            records_in = counts.records_in,
            records_out = counts.records_out,
            records_dropped = counts.records_dropped,
            duration_secs = report.duration_secs,
            "Pipeline trigger completed"
        );
        Ok(report)
    }

    /// Trigger repeatedly every `resources.poll_interval_ms` until
    /// `shutdown` turns `true` or its sender is dropped. `on_report` sees
    /// every trigger's report. Returns the number of triggers run.
    ///
    /// A trigger in progress always finishes before shutdown is honored.
    ///
    /// # Errors
    ///
    /// Returns the first error of [`Pipeline::run_once`].
    pub async fn run_continuous<F>(
        &self,
        mut shutdown: watch::Receiver<bool>,
        mut on_report: F,
    ) -> Result<u64, PipelineError>
    where
        F: FnMut(&PipelineReport),
    {
        let interval = Duration::from_millis(self.config.resources.poll_interval_ms);
        let mut triggers = 0u64;
        tracing::info!(
            pipeline = %self.id,
            poll_interval_ms = self.config.resources.poll_interval_ms,
            "Starting continuous mode"
        );

        while !*shutdown.borrow() {
            let report = self.run_once(false).await?;
            triggers += 1;
            on_report(&report);

            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(pipeline = %self.id, triggers, "Continuous mode stopped");
        Ok(triggers)
    }

    /// Return `table` to `idle` so the next trigger runs it again.
    ///
    /// With `wipe`, the table and all its descendants are also dropped and
    /// their cursors, watermarks, and schemas cleared, so they are rebuilt
    /// from their sources. Returns the tables touched.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for an unknown table, and state or
    /// I/O errors from clearing.
    pub async fn reset(&self, table: &str, wipe: bool) -> Result<Vec<String>, PipelineError> {
        if self.config.table(table).is_none() {
            return Err(PipelineError::config(table, "unknown table"));
        }
        let mut affected = vec![table.to_string()];
        if wipe {
            affected.extend(self.dag.descendants(table));
        }

        let state = Arc::clone(&self.state);
        let store = Arc::clone(&self.store);
        let id = self.id.clone();
        let names = affected.clone();
        tokio::task::spawn_blocking(move || {
            for name in &names {
                let name = TableName::new(name.clone());
                if wipe {
                    state.clear_table_state(&id, &name)?;
                    store.drop_table(&name)?;
                }
                state.set_stage_status(&id, &name, StageStatus::Idle, None)?;
            }
            Ok::<_, PipelineError>(())
        })
        .await
        .map_err(|e| PipelineError::Infrastructure(anyhow::anyhow!("reset task panicked: {e}")))??;

        tracing::info!(pipeline = %self.id, tables = ?affected, wipe, "Reset stages");
        Ok(affected)
    }

    /// Check that the state backend answers and every source directory is
    /// listable.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Infrastructure`] if the check task panics.
    pub async fn check(&self) -> Result<CheckResult, PipelineError> {
        tracing::info!(pipeline = %self.id, "Checking pipeline");
        let state = Arc::clone(&self.state);
        let id = self.id.clone();
        let config = Arc::clone(&self.config);
        let levels = self.dag.levels().to_vec();

        tokio::task::spawn_blocking(move || {
            let state_ok = match state.list_runs(&id, None, 1) {
                Ok(_) => true,
                Err(e) => {
                    tracing::error!(pipeline = %id, error = %e, "State backend check failed");
                    false
                }
            };

            let sources = config
                .tables
                .iter()
                .filter(|t| t.kind == TableKind::Streaming)
                .filter_map(|t| t.source.as_ref().map(|s| (t, s)))
                .map(|(table, source)| {
                    let watcher = SourceWatcher::new(
                        id.clone(),
                        TableName::new(table.name.clone()),
                        source.clone(),
                        Arc::clone(&state),
                    );
                    let (pending_files, error) = match watcher.pending() {
                        Ok(files) => (files.len(), None),
                        Err(e) => (0, Some(e.to_string())),
                    };
                    SourceCheck {
                        table: table.name.clone(),
                        path: source.path.display().to_string(),
                        pending_files,
                        error,
                    }
                })
                .collect();

            CheckResult {
                levels,
                sources,
                state_ok,
            }
        })
        .await
        .map_err(|e| PipelineError::Infrastructure(anyhow::anyhow!("check task panicked: {e}")))
    }

    /// Stage status, last run, size, and violation totals per table, in
    /// declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::State`] on backend failure.
    pub async fn status(&self) -> Result<Vec<TableStatus>, PipelineError> {
        let state = Arc::clone(&self.state);
        let store = Arc::clone(&self.store);
        let id = self.id.clone();
        let config = Arc::clone(&self.config);

        tokio::task::spawn_blocking(move || {
            config
                .tables
                .iter()
                .map(|t| {
                    let name = TableName::new(t.name.clone());
                    let snapshot = store.snapshot(&t.name);
                    Ok(TableStatus {
                        table: t.name.clone(),
                        kind: t.kind,
                        stage: state.get_stage_status(&id, &name)?,
                        last_run: state.list_runs(&id, Some(&name), 1)?.into_iter().next(),
                        rows: snapshot.as_ref().map(|s| s.len()),
                        version: snapshot.as_ref().map_or(0, |s| s.version()),
                        schema: state.get_schema(&id, &name)?,
                        violations: state.violation_counts(&id, &name)?,
                    })
                })
                .collect::<Result<Vec<_>, PipelineError>>()
        })
        .await
        .map_err(|e| PipelineError::Infrastructure(anyhow::anyhow!("status task panicked: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_pipeline_str;
    use medallion_types::state::TriggerOutcome;
    use medallion_types::Value;
    use std::fs;
    use std::path::Path;

    fn pipeline_yaml(root: &Path, expectation_policy: &str) -> String {
        format!(
            r#"
version: "1.0"
pipeline: premiums
processing_date: 2024-06-30
resources:
  parallelism: 2
  max_retries: 0
  retry_backoff_ms: 1
  poll_interval_ms: 10
tables:
  - name: territory_definitions
    kind: streaming
    source:
      path: {root}/territories
  - name: cgr_premiums
    kind: streaming
    source:
      path: {root}/premiums
  - name: premiums_location
    kind: joined
    primary: cgr_premiums
    reference: territory_definitions
    join: {{ left_key: territory, right_key: territory, columns: [county] }}
    expectations:
      - name: positive premium
        expect: "current_premium > 0"
        on_violation: {expectation_policy}
  - name: premiums_by_county
    kind: aggregate
    from: premiums_location
    group_by: [county]
    metrics:
      - {{ name: total_premium, function: sum, column: current_premium }}
    order_by: {{ column: total_premium, descending: true }}
"#,
            root = root.display()
        )
    }

    fn setup(policy: &str) -> (tempfile::TempDir, Pipeline) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("territories")).unwrap();
        fs::create_dir(dir.path().join("premiums")).unwrap();
        fs::write(
            dir.path().join("territories/t.csv"),
            "territory,county\nTERR1,CountyA\nTERR2,CountyB\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("premiums/p1.csv"),
            "id,territory,current_premium\n1,TERR1,500\n2,TERR2,-5\n3,TERR9,100\n",
        )
        .unwrap();
        let config = parse_pipeline_str(&pipeline_yaml(dir.path(), policy)).unwrap();
        let state: Arc<dyn StateBackend> = Arc::new(SqliteStateBackend::in_memory().unwrap());
        let pipeline = Pipeline::new(config, state, TableStore::in_memory()).unwrap();
        (dir, pipeline)
    }

    #[tokio::test]
    async fn test_first_trigger_runs_every_level() {
        let (_dir, pipeline) = setup("drop");
        let report = pipeline.run_once(false).await.unwrap();

        let names: Vec<_> = report.stages.iter().map(|s| s.table.as_str()).collect();
        assert_eq!(
            names,
            [
                "territory_definitions",
                "cgr_premiums",
                "premiums_location",
                "premiums_by_county"
            ]
        );
        assert_eq!(report.outcome(), TriggerOutcome::PartialSuccess);

        let silver = report.stage("premiums_location").unwrap();
        assert_eq!(silver.stats.records_in, 3);
        assert_eq!(silver.stats.records_dropped, 1);
        assert_eq!(pipeline.store().snapshot("premiums_location").unwrap().len(), 2);

        let gold = pipeline.store().snapshot("premiums_by_county").unwrap();
        assert_eq!(gold.rows()[0].get("county"), &Value::from("CountyA"));
        assert!(gold.rows()[1].get("county").is_null());
    }

    #[tokio::test]
    async fn test_second_trigger_without_new_files_skips_everything() {
        let (_dir, pipeline) = setup("drop");
        pipeline.run_once(false).await.unwrap();
        let report = pipeline.run_once(false).await.unwrap();
        assert!(report
            .stages
            .iter()
            .all(|s| s.outcome == StageOutcome::Skipped));
        assert_eq!(report.outcome(), TriggerOutcome::Success);
    }

    #[tokio::test]
    async fn test_fail_policy_blocks_descendants_until_reset() {
        let (dir, pipeline) = setup("fail");
        let report = pipeline.run_once(false).await.unwrap();

        let silver = report.stage("premiums_location").unwrap();
        assert!(matches!(silver.outcome, StageOutcome::Failed { .. }));
        assert_eq!(
            report.stage("premiums_by_county").unwrap().outcome,
            StageOutcome::Blocked {
                upstream: "premiums_location".into()
            }
        );
        assert!(pipeline.store().snapshot("premiums_location").is_none());

        // New bronze data does not unblock the failed stage.
        fs::write(
            dir.path().join("premiums/p2.csv"),
            "id,territory,current_premium\n4,TERR1,10\n",
        )
        .unwrap();
        let report = pipeline.run_once(false).await.unwrap();
        assert!(matches!(
            report.stage("premiums_location").unwrap().outcome,
            StageOutcome::AwaitingReset { .. }
        ));
        assert!(matches!(
            report.stage("cgr_premiums").unwrap().outcome,
            StageOutcome::Completed(_)
        ));

        let touched = pipeline.reset("premiums_location", false).await.unwrap();
        assert_eq!(touched, ["premiums_location"]);
        let report = pipeline.run_once(false).await.unwrap();
        // The bad row is still upstream, so the stage fails again.
        assert!(matches!(
            report.stage("premiums_location").unwrap().outcome,
            StageOutcome::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_reset_with_wipe_rebuilds_descendants() {
        let (_dir, pipeline) = setup("drop");
        pipeline.run_once(false).await.unwrap();

        let touched = pipeline.reset("cgr_premiums", true).await.unwrap();
        assert_eq!(touched, ["cgr_premiums", "premiums_location", "premiums_by_county"]);
        assert!(pipeline.store().snapshot("premiums_location").is_none());

        let report = pipeline.run_once(false).await.unwrap();
        assert_eq!(
            report.stage("territory_definitions").unwrap().outcome,
            StageOutcome::Skipped
        );
        assert_eq!(pipeline.store().snapshot("cgr_premiums").unwrap().len(), 3);
        assert_eq!(pipeline.store().snapshot("premiums_location").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_source_directory_fails_stage() {
        let (dir, pipeline) = setup("drop");
        fs::remove_dir_all(dir.path().join("territories")).unwrap();
        let report = pipeline.run_once(false).await.unwrap();
        let stage = report.stage("territory_definitions").unwrap();
        assert!(matches!(
            &stage.outcome,
            StageOutcome::Failed { category, .. } if *category == medallion_types::error::ErrorCategory::Io
        ));
        assert!(stage.run_id.is_some());
        assert!(matches!(
            report.stage("premiums_location").unwrap().outcome,
            StageOutcome::Blocked { .. }
        ));
    }

    #[tokio::test]
    async fn test_io_errors_are_retried_before_failing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = parse_pipeline_str(&pipeline_yaml(dir.path(), "drop")).unwrap();
        config.resources.max_retries = 2;
        let state: Arc<dyn StateBackend> = Arc::new(SqliteStateBackend::in_memory().unwrap());
        let pipeline = Pipeline::new(config, state, TableStore::in_memory()).unwrap();

        let report = pipeline.run_once(false).await.unwrap();
        let stage = report.stage("cgr_premiums").unwrap();
        assert_eq!(stage.retry_count, 2);
        assert!(matches!(
            &stage.outcome,
            StageOutcome::Failed { category, .. } if *category == medallion_types::error::ErrorCategory::Io
        ));
        // Both bronze stages retried twice.
        assert_eq!(report.retry_count, 4);
        assert_eq!(report.outcome(), TriggerOutcome::Failure);
    }

    #[tokio::test]
    async fn test_continuous_mode_stops_on_shutdown() {
        let (_dir, pipeline) = setup("drop");
        let (tx, rx) = watch::channel(false);
        let mut seen = 0;
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });
        let triggers = pipeline
            .run_continuous(rx, |_| seen += 1)
            .await
            .unwrap();
        stopper.await.unwrap();
        assert!(triggers >= 1);
        assert_eq!(triggers, seen);
    }

    #[tokio::test]
    async fn test_check_reports_sources_and_levels() {
        let (_dir, pipeline) = setup("drop");
        let check = pipeline.check().await.unwrap();
        assert!(check.is_ok());
        assert_eq!(check.levels.len(), 3);
        assert_eq!(check.sources.len(), 2);
        assert!(check.sources.iter().all(|s| s.pending_files == 1));
    }

    #[tokio::test]
    async fn test_status_reflects_runs_and_violations() {
        let (_dir, pipeline) = setup("drop");
        pipeline.run_once(false).await.unwrap();
        let status = pipeline.status().await.unwrap();
        let silver = status
            .iter()
            .find(|s| s.table == "premiums_location")
            .unwrap();
        assert_eq!(silver.rows, Some(2));
        assert_eq!(
            silver.stage.as_ref().map(|s| s.status),
            Some(StageStatus::Succeeded)
        );
        assert_eq!(silver.violations, vec![("positive premium".to_string(), 1)]);
        assert_eq!(
            silver.last_run.as_ref().map(|r| r.outcome),
            Some(TriggerOutcome::PartialSuccess)
        );
        let committed = pipeline.store().snapshot("premiums_location").unwrap();
        assert_eq!(silver.schema.as_ref(), Some(committed.schema()));
        assert!(silver
            .schema
            .as_ref()
            .is_some_and(|s| s.names().any(|n| n == "county")));
    }

    #[tokio::test]
    async fn test_status_reads_schema_recorded_by_earlier_process() {
        let (dir, pipeline) = setup("drop");
        pipeline.run_once(false).await.unwrap();
        let config = pipeline.config().clone();
        let state = Arc::clone(&pipeline.state);
        drop(pipeline);

        let reopened = Pipeline::new(config, state, TableStore::in_memory()).unwrap();
        let status = reopened.status().await.unwrap();
        let bronze = status.iter().find(|s| s.table == "cgr_premiums").unwrap();
        assert_eq!(bronze.rows, None);
        let names: Vec<_> = bronze.schema.as_ref().unwrap().names().collect();
        assert_eq!(names, ["id", "territory", "current_premium"]);
        drop(dir);
    }

    #[test]
    fn test_cyclic_config_is_rejected() {
        let mut config = parse_pipeline_str(&pipeline_yaml(Path::new("/tmp"), "drop")).unwrap();
        config.tables[2].primary = Some("premiums_by_county".into());
        let state: Arc<dyn StateBackend> = Arc::new(SqliteStateBackend::in_memory().unwrap());
        let Err(err) = Pipeline::new(config, state, TableStore::in_memory()) else {
            panic!("expected a cycle error");
        };
        assert!(err.to_string().contains("cycle"));
    }
}
