use std::path::Path;

use anyhow::Result;

/// Execute the `reset` command: return a stage to idle, optionally wiping
/// the table and everything downstream of it.
pub async fn execute(pipeline_path: &Path, table: &str, wipe: bool) -> Result<()> {
    let pipeline = super::open(pipeline_path)?;
    let touched = pipeline.reset(table, wipe).await?;
    if wipe {
        println!("Wiped and reset: {}", touched.join(", "));
    } else {
        println!("Reset '{table}' to idle.");
    }
    Ok(())
}
