//! Pipeline YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::PipelineConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_else(|_| {
            missing.push(cap[1].to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(result.into_owned())
}

/// Parse a pipeline YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_pipeline_str(yaml_str: &str) -> Result<PipelineConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    let config: PipelineConfig =
        serde_yaml::from_str(&substituted).context("Failed to parse pipeline YAML")?;
    Ok(config)
}

/// Parse a pipeline YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_pipeline(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    parse_pipeline_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("MEDALLION_TEST_LANDING", "/mnt/landing");
        let input = "path: ${MEDALLION_TEST_LANDING}/premiums";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "path: /mnt/landing/premiums");
        std::env::remove_var("MEDALLION_TEST_LANDING");
    }

    #[test]
    fn test_no_env_vars_passthrough() {
        let input = "pipeline: premiums\nmode: triggered";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_multiple_missing_env_vars_all_reported() {
        let input = "${MEDALLION_MISSING_X} and ${MEDALLION_MISSING_Y}";
        let err_msg = substitute_env_vars(input).unwrap_err().to_string();
        assert!(err_msg.contains("MEDALLION_MISSING_X"));
        assert!(err_msg.contains("MEDALLION_MISSING_Y"));
    }

    #[test]
    fn test_parse_pipeline_from_string() {
        std::env::set_var("MEDALLION_TEST_STATE_DB", "/tmp/medallion-state.db");
        let yaml = r#"
version: "1.0"
pipeline: vehicle_premiums
state:
  connection: ${MEDALLION_TEST_STATE_DB}
tables:
  - name: cgr_premiums
    kind: streaming
    source:
      path: /data/premiums
"#;
        let config = parse_pipeline_str(yaml).unwrap();
        assert_eq!(config.pipeline, "vehicle_premiums");
        assert_eq!(
            config.state.connection.as_deref(),
            Some("/tmp/medallion-state.db")
        );
        std::env::remove_var("MEDALLION_TEST_STATE_DB");
    }

    #[test]
    fn test_parse_invalid_yaml_errors() {
        let yaml = "this is not: [valid: yaml: {{{}}}";
        assert!(parse_pipeline_str(yaml).is_err());
    }

    #[test]
    fn test_parse_pipeline_file_not_found() {
        let err_msg = parse_pipeline(Path::new("/nonexistent/pipeline.yaml"))
            .unwrap_err()
            .to_string();
        assert!(err_msg.contains("Failed to read pipeline file"));
    }
}
