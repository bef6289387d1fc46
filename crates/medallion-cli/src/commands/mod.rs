pub mod check;
pub mod query;
pub mod reset;
pub mod run;
pub mod status;

use std::path::Path;

use anyhow::{Context, Result};
use medallion_engine::config::{parse_pipeline, validate_pipeline};
use medallion_engine::{Pipeline, PipelineConfig};

/// Parse and validate a pipeline file.
fn load_config(pipeline_path: &Path) -> Result<PipelineConfig> {
    let config = parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;
    validate_pipeline(&config)?;
    Ok(config)
}

/// Parse, validate, and open a pipeline with its state and tables.
fn open(pipeline_path: &Path) -> Result<Pipeline> {
    let config = load_config(pipeline_path)?;
    let name = config.pipeline.clone();
    Pipeline::open(config).with_context(|| format!("Failed to open pipeline '{name}'"))
}
