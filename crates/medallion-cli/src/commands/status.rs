use std::path::Path;

use anyhow::Result;
use medallion_engine::TableStatus;

/// Execute the `status` command: per-table stage state, last run, and
/// violation counts.
pub async fn execute(pipeline_path: &Path, json: bool) -> Result<()> {
    let pipeline = super::open(pipeline_path)?;
    let statuses = pipeline.status().await?;

    if json {
        let tables: Vec<_> = statuses.iter().map(to_json).collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "pipeline": pipeline.config().pipeline,
                "tables": tables,
            }))?
        );
        return Ok(());
    }

    println!("Pipeline '{}'", pipeline.config().pipeline);
    for status in &statuses {
        let stage = status
            .stage
            .as_ref()
            .map_or("never run", |s| s.status.as_str());
        let rows = status
            .rows
            .map_or_else(|| "-".to_string(), |r| r.to_string());
        println!(
            "  {:<28} {:<10} {:<10} rows={rows} version={}",
            status.table,
            status.kind.as_str(),
            stage,
            status.version
        );
        if let Some(schema) = &status.schema {
            let columns: Vec<_> = schema
                .columns()
                .iter()
                .map(|c| format!("{}:{}", c.name, c.column_type))
                .collect();
            println!("    schema v{}: {}", schema.version(), columns.join(", "));
        }
        if let Some(reason) = status.stage.as_ref().and_then(|s| s.reason.as_deref()) {
            println!("    reason: {reason}");
        }
        if let Some(run) = &status.last_run {
            println!(
                "    last run #{} {} at {}: in={} out={} dropped={} parse_errors={}",
                run.run_id,
                run.outcome,
                run.finished_at.as_deref().unwrap_or(&run.started_at),
                run.stats.records_in,
                run.stats.records_out,
                run.stats.records_dropped,
                run.stats.parse_errors
            );
        }
        for (constraint, count) in &status.violations {
            println!("    violations '{constraint}': {count}");
        }
    }
    Ok(())
}

fn to_json(status: &TableStatus) -> serde_json::Value {
    serde_json::json!({
        "table": status.table,
        "kind": status.kind.as_str(),
        "status": status.stage.as_ref().map(|s| s.status.as_str()),
        "reason": status.stage.as_ref().and_then(|s| s.reason.clone()),
        "rows": status.rows,
        "version": status.version,
        "schema": status.schema,
        "last_run": status.last_run.as_ref().map(|r| serde_json::json!({
            "run_id": r.run_id,
            "outcome": r.outcome.as_str(),
            "started_at": r.started_at,
            "finished_at": r.finished_at,
            "stats": r.stats,
        })),
        "violations": status
            .violations
            .iter()
            .map(|(name, count)| serde_json::json!({ "constraint": name, "count": count }))
            .collect::<Vec<_>>(),
    })
}
