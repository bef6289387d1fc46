//! Pipeline YAML configuration types.

use std::path::PathBuf;

use chrono::NaiveDate;
use medallion_types::schema::SchemaEvolutionPolicy;
use medallion_types::state::ViolationPolicy;
use serde::{Deserialize, Serialize};

/// Top-level pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub version: String,
    pub pipeline: String,
    #[serde(default)]
    pub mode: PipelineMode,
    /// Value of `current_date()` in expressions. Defaults to today (UTC).
    #[serde(default)]
    pub processing_date: Option<NaiveDate>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    pub tables: Vec<TableConfig>,
}

impl PipelineConfig {
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// Execution mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// Run every stage once, then stop.
    #[default]
    Triggered,
    /// Keep polling sources and re-running stages until shutdown.
    Continuous,
}

/// Where table snapshots are persisted. `None` keeps tables in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackendKind,
    /// Database path. `None` uses an in-memory database.
    #[serde(default)]
    pub connection: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Concurrent stages per DAG level and aggregation partitions.
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    /// Retries of a stage after a retryable (I/O) failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Interval between triggers in continuous mode.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_parallelism() -> u32 {
    4
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    200
}
fn default_poll_interval_ms() -> u64 {
    5_000
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

// ── Tables ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    /// Bronze: append-only ingestion from a source directory.
    Streaming,
    /// Silver: primary rows left-joined to a reference table, derived, and filtered.
    Joined,
    /// Gold: grouped aggregates recomputed every trigger.
    Aggregate,
}

impl TableKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Joined => "joined",
            Self::Aggregate => "aggregate",
        }
    }
}

/// One table and the stage that produces it.
///
/// Kind-specific fields are optional here and checked by the validator so
/// every misconfiguration is reported at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    pub kind: TableKind,

    // streaming
    #[serde(default)]
    pub source: Option<SourceConfig>,
    #[serde(default)]
    pub schema_evolution: SchemaEvolutionPolicy,

    // joined
    #[serde(default)]
    pub primary: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub join: Option<JoinConfig>,
    #[serde(default)]
    pub derive: Vec<DeriveConfig>,
    #[serde(default)]
    pub expectations: Vec<ExpectationConfig>,
    #[serde(default)]
    pub refresh: RefreshMode,

    // aggregate
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
    #[serde(default)]
    pub order_by: Option<OrderByConfig>,
}

impl TableConfig {
    /// Names of the tables this one reads.
    #[must_use]
    pub fn dependencies(&self) -> Vec<&str> {
        match self.kind {
            TableKind::Streaming => Vec::new(),
            TableKind::Joined => self
                .primary
                .iter()
                .chain(self.reference.iter())
                .map(String::as_str)
                .collect(),
            TableKind::Aggregate => self.from.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    #[default]
    Csv,
    Json,
    Avro,
}

impl SourceFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Avro => "avro",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub format: SourceFormat,
    #[serde(default = "default_true")]
    pub infer_column_types: bool,
    /// CSV field delimiter.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

fn default_true() -> bool {
    true
}
fn default_delimiter() -> char {
    ','
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinConfig {
    pub left_key: String,
    pub right_key: String,
    /// Reference columns to carry over. Empty means all but the join key.
    #[serde(default)]
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeriveConfig {
    pub name: String,
    pub expr: String,
}

/// How an expectation treats a predicate that evaluates to null.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullHandling {
    /// Unknown counts as a violation.
    #[default]
    Violate,
    /// Unknown counts as a pass.
    Pass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectationConfig {
    pub name: String,
    pub expect: String,
    #[serde(default)]
    pub on_violation: ViolationPolicy,
    #[serde(default)]
    pub on_null: NullHandling,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// Process only new primary rows and append.
    #[default]
    Incremental,
    /// Recompute from the whole primary table and replace.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    pub name: String,
    pub function: AggregateFunction,
    /// Input column. `count` without a column counts rows.
    #[serde(default)]
    pub column: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderByConfig {
    pub column: String,
    #[serde(default = "default_true")]
    pub descending: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal_pipeline() {
        let yaml = r#"
version: "1.0"
pipeline: premiums
tables:
  - name: cgr_premiums
    kind: streaming
    source:
      path: /data/premiums
"#;
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pipeline, "premiums");
        assert_eq!(config.mode, PipelineMode::Triggered);
        assert!(config.processing_date.is_none());
        assert!(config.storage.path.is_none());
        assert_eq!(config.state.backend, StateBackendKind::Sqlite);
        assert_eq!(config.resources.parallelism, 4);
        assert_eq!(config.resources.max_retries, 3);

        let table = &config.tables[0];
        assert_eq!(table.kind, TableKind::Streaming);
        let source = table.source.as_ref().unwrap();
        assert_eq!(source.format, SourceFormat::Csv);
        assert!(source.infer_column_types);
        assert_eq!(source.delimiter, ',');
        assert!(table.dependencies().is_empty());
    }

    #[test]
    fn test_deserialize_joined_and_aggregate() {
        let yaml = r#"
version: "1.0"
pipeline: premiums
mode: continuous
processing_date: 2024-06-30
tables:
  - name: premiums_location
    kind: joined
    primary: cgr_premiums
    reference: territory_definitions
    join: { left_key: territory, right_key: territory }
    refresh: full
    expectations:
      - name: valid age
        expect: "customer_age < 100"
        on_violation: drop
        on_null: pass
  - name: premiums_by_town
    kind: aggregate
    from: premiums_location
    group_by: [town]
    metrics:
      - { name: number_of_customers, function: count }
    order_by: { column: number_of_customers }
"#;
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mode, PipelineMode::Continuous);
        assert_eq!(
            config.processing_date,
            NaiveDate::from_ymd_opt(2024, 6, 30)
        );

        let joined = config.table("premiums_location").unwrap();
        assert_eq!(
            joined.dependencies(),
            vec!["cgr_premiums", "territory_definitions"]
        );
        assert_eq!(joined.refresh, RefreshMode::Full);
        let exp = &joined.expectations[0];
        assert_eq!(exp.on_violation, ViolationPolicy::Drop);
        assert_eq!(exp.on_null, NullHandling::Pass);
        assert!(joined.join.as_ref().unwrap().columns.is_empty());

        let gold = config.table("premiums_by_town").unwrap();
        assert_eq!(gold.dependencies(), vec!["premiums_location"]);
        assert_eq!(gold.metrics[0].function, AggregateFunction::Count);
        assert!(gold.order_by.as_ref().unwrap().descending);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let yaml = r#"
version: "1.0"
pipeline: p
tables:
  - name: t
    kind: materialized
"#;
        assert!(serde_yaml::from_str::<PipelineConfig>(yaml).is_err());
    }
}
