use std::path::Path;

use anyhow::Result;

/// Execute the `check` command: validate pipeline config, sources, and state.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    let pipeline = super::open(pipeline_path)?;
    println!("Pipeline structure: OK");

    let result = pipeline.check().await?;

    for (i, level) in result.levels.iter().enumerate() {
        println!("Level {i}:            {}", level.join(", "));
    }
    for source in &result.sources {
        match &source.error {
            None => println!(
                "{:18} OK ({} pending file(s) in {})",
                format!("{}:", source.table),
                source.pending_files,
                source.path
            ),
            Some(error) => {
                println!("{:18} FAILED", format!("{}:", source.table));
                println!("  {error}");
            }
        }
    }
    if result.state_ok {
        println!("State backend:     OK");
    } else {
        println!("State backend:     FAILED");
    }

    if result.is_ok() {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}
