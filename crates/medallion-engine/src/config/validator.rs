//! Semantic validation for parsed pipeline configuration values.

use std::collections::HashSet;

use anyhow::{bail, Result};

use crate::config::types::{
    AggregateFunction, PipelineConfig, SourceFormat, TableConfig, TableKind,
};
use crate::dag::Dag;
use crate::expr::Expr;

/// Report duplicate or empty names within one list.
fn check_names<'a>(
    names: impl IntoIterator<Item = &'a str>,
    context: &str,
    what: &str,
    errors: &mut Vec<String>,
) {
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            errors.push(format!("{context}: {what} with an empty name"));
        } else if !seen.insert(name) {
            errors.push(format!("{context}: duplicate {what} '{name}'"));
        }
    }
}

fn check_expression(source: &str, context: &str, errors: &mut Vec<String>) {
    if let Err(e) = Expr::parse(source) {
        errors.push(format!("{context}: {e}"));
    }
}

fn validate_streaming(table: &TableConfig, context: &str, errors: &mut Vec<String>) {
    match &table.source {
        None => errors.push(format!("{context}: streaming table requires 'source'")),
        Some(source) => {
            if source.path.as_os_str().is_empty() {
                errors.push(format!("{context}: source path must not be empty"));
            }
            if source.format == SourceFormat::Avro {
                errors.push(format!(
                    "{context}: source format 'avro' is not supported by this build"
                ));
            }
            if !source.delimiter.is_ascii() {
                errors.push(format!("{context}: CSV delimiter must be a single ASCII character"));
            }
        }
    }
}

fn validate_joined(table: &TableConfig, context: &str, errors: &mut Vec<String>) {
    if table.primary.is_none() {
        errors.push(format!("{context}: joined table requires 'primary'"));
    }
    match (&table.reference, &table.join) {
        (Some(_), None) => errors.push(format!(
            "{context}: 'reference' requires a 'join' with left_key and right_key"
        )),
        (None, Some(_)) => errors.push(format!("{context}: 'join' requires a 'reference' table")),
        (Some(_), Some(join)) => {
            if join.left_key.trim().is_empty() || join.right_key.trim().is_empty() {
                errors.push(format!("{context}: join keys must not be empty"));
            }
        }
        (None, None) => {}
    }

    check_names(
        table.derive.iter().map(|d| d.name.as_str()),
        context,
        "derived column",
        errors,
    );
    for derive in &table.derive {
        check_expression(
            &derive.expr,
            &format!("{context}: derived column '{}'", derive.name),
            errors,
        );
    }

    check_names(
        table.expectations.iter().map(|e| e.name.as_str()),
        context,
        "expectation",
        errors,
    );
    for expectation in &table.expectations {
        check_expression(
            &expectation.expect,
            &format!("{context}: expectation '{}'", expectation.name),
            errors,
        );
    }
}

fn validate_aggregate(table: &TableConfig, context: &str, errors: &mut Vec<String>) {
    if table.from.is_none() {
        errors.push(format!("{context}: aggregate table requires 'from'"));
    }
    if table.metrics.is_empty() {
        errors.push(format!("{context}: aggregate table requires at least one metric"));
    }

    check_names(
        table
            .group_by
            .iter()
            .map(String::as_str)
            .chain(table.metrics.iter().map(|m| m.name.as_str())),
        context,
        "output column",
        errors,
    );

    for metric in &table.metrics {
        if metric.function != AggregateFunction::Count && metric.column.is_none() {
            errors.push(format!(
                "{context}: metric '{}' ({}) requires a 'column'",
                metric.name,
                metric.function.as_str()
            ));
        }
    }

    if let Some(order_by) = &table.order_by {
        let known = table.group_by.iter().any(|g| *g == order_by.column)
            || table.metrics.iter().any(|m| m.name == order_by.column);
        if !known {
            errors.push(format!(
                "{context}: order_by column '{}' is neither a group_by column nor a metric",
                order_by.column
            ));
        }
    }
}

/// Fields that only make sense for another kind are rejected rather than
/// silently ignored.
fn validate_foreign_fields(table: &TableConfig, context: &str, errors: &mut Vec<String>) {
    let kind = table.kind.as_str();
    let mut foreign = Vec::new();
    if table.kind != TableKind::Streaming && table.source.is_some() {
        foreign.push("source");
    }
    if table.kind != TableKind::Joined {
        if table.primary.is_some() {
            foreign.push("primary");
        }
        if table.reference.is_some() {
            foreign.push("reference");
        }
        if !table.derive.is_empty() {
            foreign.push("derive");
        }
        if !table.expectations.is_empty() {
            foreign.push("expectations");
        }
    }
    if table.kind != TableKind::Aggregate {
        if table.from.is_some() {
            foreign.push("from");
        }
        if !table.metrics.is_empty() {
            foreign.push("metrics");
        }
        if !table.group_by.is_empty() {
            foreign.push("group_by");
        }
    }
    for field in foreign {
        errors.push(format!("{context}: field '{field}' is not valid for kind '{kind}'"));
    }
}

/// Validate a parsed pipeline configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipeline config.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    if config.tables.is_empty() {
        errors.push("Pipeline must define at least one table".to_string());
    }

    if config.resources.parallelism == 0 {
        errors.push("parallelism must be at least 1".to_string());
    }

    if config.resources.poll_interval_ms == 0 {
        errors.push("poll_interval_ms must be at least 1".to_string());
    }

    check_names(
        config.tables.iter().map(|t| t.name.as_str()),
        "tables",
        "table",
        &mut errors,
    );

    for table in &config.tables {
        let context = format!("table '{}'", table.name);
        validate_foreign_fields(table, &context, &mut errors);
        match table.kind {
            TableKind::Streaming => validate_streaming(table, &context, &mut errors),
            TableKind::Joined => validate_joined(table, &context, &mut errors),
            TableKind::Aggregate => validate_aggregate(table, &context, &mut errors),
        }
    }

    if let Err(dag_errors) = Dag::build(
        config
            .tables
            .iter()
            .map(|t| (t.name.as_str(), t.dependencies())),
    ) {
        errors.extend(dag_errors.into_iter().map(|e| e.to_string()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_pipeline_str;

    fn valid_yaml() -> &'static str {
        r#"
version: "1.0"
pipeline: vehicle_premiums
tables:
  - name: cgr_premiums
    kind: streaming
    source:
      path: /data/premiums
  - name: territory_definitions
    kind: streaming
    source:
      path: /data/territory
  - name: premiums_location
    kind: joined
    primary: cgr_premiums
    reference: territory_definitions
    join: { left_key: territory, right_key: territory }
    derive:
      - name: customer_age
        expr: "datediff(year, birthdate, current_date())"
    expectations:
      - name: valid age
        expect: "customer_age < 100 and customer_age > 0"
        on_violation: drop
  - name: premiums_by_town
    kind: aggregate
    from: premiums_location
    group_by: [town]
    metrics:
      - { name: average_premium, function: avg, column: current_premium }
      - { name: number_of_customers, function: count }
    order_by: { column: average_premium }
"#
    }

    fn validation_error(yaml: &str) -> String {
        let config = parse_pipeline_str(yaml).unwrap();
        validate_pipeline(&config).unwrap_err().to_string()
    }

    #[test]
    fn test_valid_pipeline_passes() {
        let config = parse_pipeline_str(valid_yaml()).unwrap();
        validate_pipeline(&config).unwrap();
    }

    #[test]
    fn test_wrong_version_fails() {
        let err = validation_error(&valid_yaml().replace("\"1.0\"", "\"2.0\""));
        assert!(err.contains("Unsupported pipeline version"));
    }

    #[test]
    fn test_duplicate_table_names_fail() {
        let err = validation_error(
            &valid_yaml().replace("name: territory_definitions", "name: cgr_premiums"),
        );
        assert!(err.contains("duplicate table 'cgr_premiums'"));
    }

    #[test]
    fn test_unknown_dependency_fails() {
        let err = validation_error(&valid_yaml().replace("from: premiums_location", "from: nope"));
        assert!(err.contains("unknown table 'nope'"));
    }

    #[test]
    fn test_cycle_fails() {
        let yaml = r#"
version: "1.0"
pipeline: p
tables:
  - name: a
    kind: joined
    primary: b
  - name: b
    kind: joined
    primary: a
"#;
        assert!(validation_error(yaml).contains("dependency cycle"));
    }

    #[test]
    fn test_avro_is_rejected() {
        let yaml = valid_yaml().replacen(
            "path: /data/premiums",
            "path: /data/premiums\n      format: avro",
            1,
        );
        assert!(validation_error(&yaml).contains("'avro' is not supported"));
    }

    #[test]
    fn test_bad_expression_is_reported() {
        let err = validation_error(&valid_yaml().replace(
            "customer_age < 100 and customer_age > 0",
            "customer_age < ",
        ));
        assert!(err.contains("expectation 'valid age'"));
        assert!(err.contains("invalid expression"));
    }

    #[test]
    fn test_metric_without_column_fails() {
        let err = validation_error(
            &valid_yaml().replace(", column: current_premium", ""),
        );
        assert!(err.contains("metric 'average_premium' (avg) requires a 'column'"));
    }

    #[test]
    fn test_order_by_unknown_column_fails() {
        let err = validation_error(
            &valid_yaml().replace("order_by: { column: average_premium }", "order_by: { column: x }"),
        );
        assert!(err.contains("order_by column 'x'"));
    }

    #[test]
    fn test_reference_without_join_fails() {
        let err = validation_error(&valid_yaml().replace(
            "    join: { left_key: territory, right_key: territory }\n",
            "",
        ));
        assert!(err.contains("'reference' requires a 'join'"));
    }

    #[test]
    fn test_foreign_field_fails() {
        let err = validation_error(&valid_yaml().replace(
            "      path: /data/territory",
            "      path: /data/territory\n    group_by: [x]",
        ));
        assert!(err.contains("field 'group_by' is not valid for kind 'streaming'"));
    }

    #[test]
    fn test_zero_parallelism_fails() {
        let yaml = valid_yaml().replace(
            "pipeline: vehicle_premiums",
            "pipeline: vehicle_premiums\nresources:\n  parallelism: 0",
        );
        assert!(validation_error(&yaml).contains("parallelism must be at least 1"));
    }

    #[test]
    fn test_all_errors_reported_together() {
        let yaml = valid_yaml()
            .replace("\"1.0\"", "\"9\"")
            .replace("from: premiums_location", "from: nope");
        let err = validation_error(&yaml);
        assert!(err.contains("Unsupported pipeline version"));
        assert!(err.contains("unknown table 'nope'"));
    }
}
