use std::path::Path;

use anyhow::Result;
use medallion_engine::query::format_snapshot;

/// Execute the `query` command: pretty-print the current snapshot of a table.
pub fn execute(pipeline_path: &Path, table: &str, limit: usize) -> Result<()> {
    let pipeline = super::open(pipeline_path)?;
    if pipeline.config().table(table).is_none() {
        anyhow::bail!("Unknown table '{table}'");
    }
    let Some(snapshot) = pipeline.store().snapshot(table) else {
        anyhow::bail!("Table '{table}' has no committed data");
    };

    println!("{}", format_snapshot(&snapshot, Some(limit))?);
    println!(
        "({} of {} row(s), version {})",
        snapshot.len().min(limit),
        snapshot.len(),
        snapshot.version()
    );
    Ok(())
}
