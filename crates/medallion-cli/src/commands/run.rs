use std::path::Path;

use anyhow::Result;
use chrono::NaiveDate;
use medallion_engine::config::types::PipelineMode;
use medallion_engine::{PipelineReport, StageOutcome, StageReport};
use medallion_types::state::TriggerOutcome;
use tokio::sync::watch;

/// Execute the `run` command: parse, validate, and trigger a pipeline.
pub async fn execute(
    pipeline_path: &Path,
    continuous: bool,
    as_of: Option<NaiveDate>,
    full_refresh: bool,
) -> Result<()> {
    let mut pipeline = super::open(pipeline_path)?;
    if let Some(date) = as_of {
        pipeline = pipeline.with_processing_date(date);
    }
    let continuous = continuous || pipeline.config().mode == PipelineMode::Continuous;

    tracing::info!(
        pipeline = %pipeline.config().pipeline,
        tables = pipeline.config().tables.len(),
        levels = pipeline.dag().levels().len(),
        processing_date = %pipeline.processing_date(),
        continuous,
        "Pipeline validated"
    );

    if !continuous {
        let report = pipeline.run_once(full_refresh).await?;
        print_report(&report);
        if report.outcome() == TriggerOutcome::Failure {
            anyhow::bail!(
                "Pipeline '{}' has failed or blocked stages",
                report.pipeline
            );
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, finishing current trigger");
            let _ = shutdown_tx.send(true);
        }
    });

    if full_refresh {
        print_report(&pipeline.run_once(true).await?);
    }
    let triggers = pipeline.run_continuous(shutdown_rx, print_report).await?;
    println!("Stopped after {triggers} trigger(s).");
    Ok(())
}

fn print_report(report: &PipelineReport) {
    let ran = report
        .stages
        .iter()
        .any(|s| s.outcome != StageOutcome::Skipped);
    if !ran {
        tracing::debug!(pipeline = %report.pipeline, "No new data");
        return;
    }

    println!(
        "Pipeline '{}' trigger finished: {}",
        report.pipeline,
        report.outcome()
    );
    for stage in &report.stages {
        println!("  {}", stage_line(stage));
        match &stage.outcome {
            StageOutcome::Failed { message, .. } => println!("    error: {message}"),
            StageOutcome::Blocked { upstream } => println!("    blocked by: {upstream}"),
            StageOutcome::AwaitingReset { reason } => {
                println!(
                    "    awaiting reset: {}",
                    reason.as_deref().unwrap_or("failed earlier")
                );
            }
            StageOutcome::Completed(_) | StageOutcome::Skipped => {}
        }
    }

    let counts = report.counts();
    println!("  Files processed: {}", counts.files_processed);
    println!("  Records in:      {}", counts.records_in);
    println!("  Records out:     {}", counts.records_out);
    println!("  Dropped:         {}", counts.records_dropped);
    println!("  Warned:          {}", counts.records_warned);
    println!("  Parse errors:    {}", counts.parse_errors);
    if report.retry_count > 0 {
        println!("  Retries:         {}", report.retry_count);
    }
    println!("  Duration:        {:.2}s", report.duration_secs);
}

fn stage_line(stage: &StageReport) -> String {
    match stage.outcome {
        StageOutcome::Completed(_) | StageOutcome::Failed { .. } => format!(
            "{:<28} {:<10} {:<16} in={} out={} dropped={} {:.2}s",
            stage.table,
            stage.kind.as_str(),
            stage.outcome.label(),
            stage.stats.records_in,
            stage.stats.records_out,
            stage.stats.records_dropped,
            stage.duration_secs,
        ),
        _ => format!(
            "{:<28} {:<10} {}",
            stage.table,
            stage.kind.as_str(),
            stage.outcome.label()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medallion_engine::config::types::TableKind;
    use medallion_types::state::RunStats;

    fn report(outcome: StageOutcome) -> StageReport {
        StageReport {
            table: "premiums_location".into(),
            kind: TableKind::Joined,
            outcome,
            stats: RunStats {
                records_in: 7,
                records_out: 5,
                records_dropped: 2,
                ..RunStats::default()
            },
            run_id: Some(3),
            retry_count: 0,
            duration_secs: 0.5,
        }
    }

    #[test]
    fn test_stage_line_shows_counts_for_runs() {
        let line = stage_line(&report(StageOutcome::Completed(
            TriggerOutcome::PartialSuccess,
        )));
        assert!(line.starts_with("premiums_location"));
        assert!(line.contains("partial_success"));
        assert!(line.contains("in=7 out=5 dropped=2"));
    }

    #[test]
    fn test_stage_line_omits_counts_when_not_run() {
        let line = stage_line(&report(StageOutcome::Blocked {
            upstream: "cgr_premiums".into(),
        }));
        assert!(line.ends_with("blocked"));
        assert!(!line.contains("in="));
    }
}
