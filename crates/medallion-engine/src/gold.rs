//! Gold stage: grouped aggregates recomputed from the full input snapshot.
//!
//! Rows are partitioned by group key, so every group is accumulated by a
//! single worker in input order and the result does not depend on the
//! number of partitions.

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use medallion_types::schema::ColumnSchema;
use medallion_types::{ColumnType, Record, Schema, Value};

use crate::config::types::{AggregateFunction, MetricConfig, OrderByConfig, TableConfig};
use crate::errors::PipelineError;
use crate::key::KeyPart;
use crate::table::TableSnapshot;

/// Compiled definition of an aggregate table.
#[derive(Debug, Clone)]
pub struct AggregateSpec {
    pub table: String,
    pub group_by: Vec<String>,
    pub metrics: Vec<MetricConfig>,
    pub order_by: Option<OrderByConfig>,
}

impl AggregateSpec {
    #[must_use]
    pub fn from_config(config: &TableConfig) -> Self {
        Self {
            table: config.name.clone(),
            group_by: config.group_by.clone(),
            metrics: config.metrics.clone(),
            order_by: config.order_by.clone(),
        }
    }
}

/// Aggregated rows and their schema.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateOutput {
    pub schema: Schema,
    pub rows: Vec<Record>,
}

// ── Accumulators ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Accumulator {
    Count(i64),
    Sum {
        int: i128,
        float: f64,
        has_float: bool,
        seen: bool,
    },
    Avg {
        sum: f64,
        count: u64,
    },
    Min(Value),
    Max(Value),
}

impl Accumulator {
    fn new(function: AggregateFunction) -> Self {
        match function {
            AggregateFunction::Count => Self::Count(0),
            AggregateFunction::Sum => Self::Sum {
                int: 0,
                float: 0.0,
                has_float: false,
                seen: false,
            },
            AggregateFunction::Avg => Self::Avg { sum: 0.0, count: 0 },
            AggregateFunction::Min => Self::Min(Value::Null),
            AggregateFunction::Max => Self::Max(Value::Null),
        }
    }

    /// Fold one input cell. `None` means `count(*)`.
    fn update(&mut self, cell: Option<&Value>) -> Result<(), String> {
        let Some(value) = cell else {
            if let Self::Count(n) = self {
                *n += 1;
            }
            return Ok(());
        };
        if value.is_null() {
            return Ok(());
        }
        match self {
            Self::Count(n) => *n += 1,
            Self::Sum {
                int,
                float,
                has_float,
                seen,
            } => {
                *seen = true;
                match value {
                    Value::Integer(i) => *int += i128::from(*i),
                    Value::Float(f) => {
                        *float += f;
                        *has_float = true;
                    }
                    other => return Err(format!("cannot sum non-numeric value '{other}'")),
                }
            }
            Self::Avg { sum, count } => {
                let v = value
                    .as_f64()
                    .ok_or_else(|| format!("cannot average non-numeric value '{value}'"))?;
                *sum += v;
                *count += 1;
            }
            Self::Min(current) => {
                if current.is_null() || value.compare(current) == Some(Ordering::Less) {
                    *current = value.clone();
                }
            }
            Self::Max(current) => {
                if current.is_null() || value.compare(current) == Some(Ordering::Greater) {
                    *current = value.clone();
                }
            }
        }
        Ok(())
    }

    /// Combine a partial result produced from other rows.
    fn merge(&mut self, other: Self) {
        match (self, other) {
            (Self::Count(a), Self::Count(b)) => *a += b,
            (
                Self::Sum {
                    int,
                    float,
                    has_float,
                    seen,
                },
                Self::Sum {
                    int: i2,
                    float: f2,
                    has_float: h2,
                    seen: s2,
                },
            ) => {
                *int += i2;
                *float += f2;
                *has_float |= h2;
                *seen |= s2;
            }
            (Self::Avg { sum, count }, Self::Avg { sum: s2, count: c2 }) => {
                *sum += s2;
                *count += c2;
            }
            (Self::Min(a), Self::Min(b)) => {
                if a.is_null() || b.compare(a) == Some(Ordering::Less) {
                    *a = b;
                }
            }
            (Self::Max(a), Self::Max(b)) => {
                if a.is_null() || b.compare(a) == Some(Ordering::Greater) {
                    *a = b;
                }
            }
            _ => {}
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn finish(self) -> Value {
        match self {
            Self::Count(n) => Value::Integer(n),
            Self::Sum { seen: false, .. } => Value::Null,
            Self::Sum {
                int,
                float,
                has_float: false,
                ..
            } => i64::try_from(int).map_or(Value::Float(int as f64 + float), Value::Integer),
            Self::Sum { int, float, .. } => Value::Float(int as f64 + float),
            Self::Avg { count: 0, .. } => Value::Null,
            Self::Avg { sum, count } => Value::Float(sum / count as f64),
            Self::Min(v) | Self::Max(v) => v,
        }
    }
}

// ── Grouping ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Group {
    /// First-seen values of the grouping columns.
    values: Vec<Value>,
    accumulators: Vec<Accumulator>,
}

type Groups = HashMap<Vec<KeyPart>, Group>;

fn accumulate(rows: &[&Record], spec: &AggregateSpec) -> Result<(Groups, Vec<Vec<KeyPart>>), PipelineError> {
    let mut groups: Groups = HashMap::new();
    // Groups in first-seen order, so partial results merge deterministically.
    let mut order = Vec::new();
    for row in rows {
        let values: Vec<Value> = spec.group_by.iter().map(|c| row.get(c).clone()).collect();
        let key: Vec<KeyPart> = values.iter().map(KeyPart::of).collect();
        let group = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            Group {
                values,
                accumulators: spec
                    .metrics
                    .iter()
                    .map(|m| Accumulator::new(m.function))
                    .collect(),
            }
        });
        for (acc, metric) in group.accumulators.iter_mut().zip(&spec.metrics) {
            let cell = metric.column.as_deref().map(|c| row.get(c));
            acc.update(cell).map_err(|message| {
                PipelineError::config(&spec.table, format!("metric '{}': {message}", metric.name))
            })?;
        }
    }
    Ok((groups, order))
}

fn partition_of(row: &Record, group_by: &[String], partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    for column in group_by {
        KeyPart::of(row.get(column)).hash(&mut hasher);
    }
    usize::try_from(hasher.finish() % partitions as u64).unwrap_or(0)
}

fn output_schema(input: &Schema, spec: &AggregateSpec) -> Schema {
    let input_type = |c: &str| input.column_type(c).unwrap_or(ColumnType::String);
    let groups = spec
        .group_by
        .iter()
        .map(|c| ColumnSchema::new(c.clone(), input_type(c)));
    let metrics = spec.metrics.iter().map(|m| {
        let column_type = match (m.function, m.column.as_deref()) {
            (AggregateFunction::Count, _) => ColumnType::Integer,
            (AggregateFunction::Avg, _) => ColumnType::Float,
            (AggregateFunction::Sum, Some(c)) if input_type(c) == ColumnType::Integer => {
                ColumnType::Integer
            }
            (AggregateFunction::Sum, _) => ColumnType::Float,
            (AggregateFunction::Min | AggregateFunction::Max, Some(c)) => input_type(c),
            (AggregateFunction::Min | AggregateFunction::Max, None) => ColumnType::String,
        };
        ColumnSchema::new(m.name.clone(), column_type)
    });
    Schema::from_columns(groups.chain(metrics))
}

fn check_columns(input: &Schema, spec: &AggregateSpec) -> Result<(), PipelineError> {
    if input.is_empty() {
        return Ok(());
    }
    let referenced = spec
        .group_by
        .iter()
        .map(String::as_str)
        .chain(spec.metrics.iter().filter_map(|m| m.column.as_deref()));
    for column in referenced {
        if !input.contains(column) {
            return Err(PipelineError::config(
                &spec.table,
                format!("column '{column}' does not exist in the input table"),
            ));
        }
    }
    Ok(())
}

/// Null sorts first ascending (so last descending); incomparable values
/// are treated as equal and fall through to the tie-breaker.
fn compare_cells(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.compare(b).unwrap_or(Ordering::Equal),
    }
}

/// Recompute the aggregate over `input` using up to `partitions` workers.
///
/// One row per distinct group key (null is a group of its own). With no
/// `group_by` columns a single global row is produced, even for empty
/// input.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] if a referenced column is missing or
/// a `sum`/`avg` input is not numeric, and [`PipelineError::Infrastructure`]
/// if a worker panics.
pub fn aggregate(
    input: &TableSnapshot,
    spec: &AggregateSpec,
    partitions: usize,
) -> Result<AggregateOutput, PipelineError> {
    check_columns(input.schema(), spec)?;
    let partitions = partitions.clamp(1, input.len().max(1));

    let mut buckets: Vec<Vec<&Record>> = vec![Vec::new(); partitions];
    for row in input.rows() {
        buckets[partition_of(row, &spec.group_by, partitions)].push(row);
    }

    let partials = std::thread::scope(|scope| {
        let handles: Vec<_> = buckets
            .iter()
            .map(|bucket| scope.spawn(move || accumulate(bucket, spec)))
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .map_err(|_| anyhow::anyhow!("aggregation worker panicked"))?
            })
            .collect::<Result<Vec<_>, PipelineError>>()
    })?;

    let mut groups: Groups = HashMap::new();
    let mut order: Vec<Vec<KeyPart>> = Vec::new();
    for (partial, partial_order) in partials {
        let mut partial = partial;
        for key in partial_order {
            let Some(group) = partial.remove(&key) else {
                continue;
            };
            match groups.get_mut(&key) {
                Some(existing) => {
                    for (acc, other) in existing.accumulators.iter_mut().zip(group.accumulators) {
                        acc.merge(other);
                    }
                }
                None => {
                    order.push(key.clone());
                    groups.insert(key, group);
                }
            }
        }
    }

    if spec.group_by.is_empty() && groups.is_empty() {
        order.push(Vec::new());
        groups.insert(
            Vec::new(),
            Group {
                values: Vec::new(),
                accumulators: spec
                    .metrics
                    .iter()
                    .map(|m| Accumulator::new(m.function))
                    .collect(),
            },
        );
    }

    let mut keyed: Vec<(Vec<KeyPart>, Record)> = order
        .into_iter()
        .filter_map(|key| {
            let group = groups.remove(&key)?;
            let mut record = Record::with_capacity(spec.group_by.len() + spec.metrics.len());
            for (column, value) in spec.group_by.iter().zip(group.values) {
                record.insert(column.clone(), value);
            }
            for (metric, acc) in spec.metrics.iter().zip(group.accumulators) {
                record.insert(metric.name.clone(), acc.finish());
            }
            Some((key, record))
        })
        .collect();

    keyed.sort_by(|(ka, ra), (kb, rb)| {
        let primary = spec.order_by.as_ref().map_or(Ordering::Equal, |o| {
            let ord = compare_cells(ra.get(&o.column), rb.get(&o.column));
            if o.descending {
                ord.reverse()
            } else {
                ord
            }
        });
        primary.then_with(|| ka.cmp(kb))
    });

    let schema = output_schema(input.schema(), spec);
    let rows = keyed
        .into_iter()
        .map(|(_, record)| {
            let mut record = record;
            crate::source::infer::conform(&mut record, &schema);
            record
        })
        .collect();
    Ok(AggregateOutput { schema, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use medallion_types::state::TableName;
    use rstest::rstest;

    use crate::table::{TableStore, WriteMode};

    fn silver(rows: &[(Option<&str>, f64)]) -> std::sync::Arc<TableSnapshot> {
        let store = TableStore::in_memory();
        let schema = Schema::from_columns([
            ColumnSchema::new("town", ColumnType::String),
            ColumnSchema::new("current_premium", ColumnType::Float),
        ]);
        let records = rows
            .iter()
            .map(|(town, p)| Record::new().with("town", *town).with("current_premium", *p))
            .collect();
        store
            .commit(&TableName::new("premiums_location"), schema, records, WriteMode::Append)
            .unwrap()
    }

    fn spec() -> AggregateSpec {
        let config: TableConfig = serde_yaml::from_str(
            r"
name: premiums_by_town
kind: aggregate
from: premiums_location
group_by: [town]
metrics:
  - { name: average_premium, function: avg, column: current_premium }
  - { name: number_of_customers, function: count }
  - { name: total, function: sum, column: current_premium }
  - { name: lowest, function: min, column: current_premium }
  - { name: highest, function: max, column: current_premium }
order_by: { column: average_premium }
",
        )
        .unwrap();
        AggregateSpec::from_config(&config)
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(8)]
    fn averages_by_town_sorted_descending(#[case] partitions: usize) {
        let input = silver(&[
            (Some("Porto"), 500.0),
            (Some("Braga"), 300.0),
            (Some("Porto"), 700.0),
            (None, 100.0),
            (Some("Faro"), 550.0),
        ]);
        let out = aggregate(&input, &spec(), partitions).unwrap();
        let towns: Vec<_> = out.rows.iter().map(|r| r.get("town").clone()).collect();
        assert_eq!(
            towns,
            vec![
                Value::from("Porto"),
                Value::from("Faro"),
                Value::from("Braga"),
                Value::Null
            ]
        );
        let porto = &out.rows[0];
        assert_eq!(porto.get("average_premium"), &Value::Float(600.0));
        assert_eq!(porto.get("number_of_customers"), &Value::Integer(2));
        assert_eq!(porto.get("total"), &Value::Float(1200.0));
        assert_eq!(porto.get("lowest"), &Value::Float(500.0));
        assert_eq!(porto.get("highest"), &Value::Float(700.0));
        assert_eq!(
            out.schema.names().collect::<Vec<_>>(),
            ["town", "average_premium", "number_of_customers", "total", "lowest", "highest"]
        );
    }

    #[test]
    fn ties_break_on_group_key_ascending() {
        let input = silver(&[(Some("b"), 1.0), (Some("c"), 1.0), (Some("a"), 1.0)]);
        let out = aggregate(&input, &spec(), 3).unwrap();
        let towns: Vec<_> = out.rows.iter().map(|r| r.get("town").clone()).collect();
        assert_eq!(towns, vec![Value::from("a"), Value::from("b"), Value::from("c")]);
    }

    #[test]
    fn empty_input_yields_no_groups() {
        let input = silver(&[]);
        assert!(aggregate(&input, &spec(), 4).unwrap().rows.is_empty());
    }

    #[test]
    fn global_aggregate_always_has_one_row() {
        let mut s = spec();
        s.group_by.clear();
        s.order_by = None;
        let out = aggregate(&silver(&[]), &s, 4).unwrap();
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].get("number_of_customers"), &Value::Integer(0));
        assert!(out.rows[0].get("average_premium").is_null());
    }

    #[test]
    fn count_column_skips_nulls_and_integer_sum_stays_integer() {
        let store = TableStore::in_memory();
        let schema = Schema::from_columns([
            ColumnSchema::new("k", ColumnType::String),
            ColumnSchema::new("n", ColumnType::Integer),
        ]);
        let rows = vec![
            Record::new().with("k", "x").with("n", 2_i64),
            Record::new().with("k", "x").with("n", Value::Null),
            Record::new().with("k", "x").with("n", 5_i64),
        ];
        let input = store
            .commit(&TableName::new("t"), schema, rows, WriteMode::Append)
            .unwrap();
        let config: TableConfig = serde_yaml::from_str(
            r"
name: g
kind: aggregate
from: t
group_by: [k]
metrics:
  - { name: non_null, function: count, column: n }
  - { name: total, function: sum, column: n }
",
        )
        .unwrap();
        let out = aggregate(&input, &AggregateSpec::from_config(&config), 2).unwrap();
        assert_eq!(out.rows[0].get("non_null"), &Value::Integer(2));
        assert_eq!(out.rows[0].get("total"), &Value::Integer(7));
        assert_eq!(out.schema.column_type("total"), Some(ColumnType::Integer));
    }

    #[test]
    fn missing_column_is_config_error() {
        let mut s = spec();
        s.group_by = vec!["county".into()];
        let err = aggregate(&silver(&[(Some("Porto"), 1.0)]), &s, 1).unwrap_err();
        assert!(err.to_string().contains("county"));
    }

    #[test]
    fn non_numeric_average_is_config_error() {
        let mut s = spec();
        s.metrics[0].column = Some("town".into());
        let err = aggregate(&silver(&[(Some("Porto"), 1.0)]), &s, 1).unwrap_err();
        assert!(err.to_string().contains("average_premium"));
    }

    #[test]
    fn rerun_is_identical() {
        let input = silver(&[(Some("Porto"), 500.0), (Some("Braga"), 300.0)]);
        let a = aggregate(&input, &spec(), 4).unwrap();
        let b = aggregate(&input, &spec(), 4).unwrap();
        assert_eq!(a, b);
    }
}
