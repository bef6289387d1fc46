//! Property tests over the incremental guarantees of the engine.

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

use chrono::NaiveDate;
use medallion_engine::config::types::{AggregateFunction, MetricConfig, OrderByConfig, SourceConfig};
use medallion_engine::constraints::Constraint;
use medallion_engine::expr::EvalContext;
use medallion_engine::gold::{aggregate, AggregateSpec};
use medallion_engine::silver::{transform, SilverSpec};
use medallion_engine::source::SourceWatcher;
use medallion_engine::table::{TableSnapshot, TableStore, WriteMode};
use medallion_state::{SqliteStateBackend, StateBackend};
use medallion_types::state::{PipelineId, TableName, ViolationPolicy};
use medallion_types::{ColumnSchema, ColumnType, Record, Schema};
use proptest::prelude::*;

fn metric(name: &str, function: AggregateFunction, column: Option<&str>) -> MetricConfig {
    MetricConfig {
        name: name.to_string(),
        function,
        column: column.map(str::to_string),
    }
}

fn premiums_by_town() -> AggregateSpec {
    AggregateSpec {
        table: "premiums_by_town".into(),
        group_by: vec!["town".into()],
        metrics: vec![
            metric("customers", AggregateFunction::Count, None),
            metric("priced", AggregateFunction::Count, Some("premium")),
            metric("total", AggregateFunction::Sum, Some("premium")),
            metric("average", AggregateFunction::Avg, Some("premium")),
            metric("lowest", AggregateFunction::Min, Some("premium")),
            metric("highest", AggregateFunction::Max, Some("premium")),
        ],
        order_by: Some(OrderByConfig {
            column: "total".into(),
            descending: true,
        }),
    }
}

fn silver_snapshot(rows: &[(Option<u8>, Option<i64>)]) -> Arc<TableSnapshot> {
    let schema = Schema::from_columns([
        ColumnSchema::new("town", ColumnType::String),
        ColumnSchema::new("premium", ColumnType::Integer),
    ]);
    let records = rows
        .iter()
        .map(|(town, premium)| {
            Record::new()
                .with("town", town.map(|t| format!("town-{t}")))
                .with("premium", *premium)
        })
        .collect();
    TableStore::in_memory()
        .commit(&TableName::new("silver"), schema, records, WriteMode::Append)
        .unwrap()
}

fn rows_and_shuffle() -> impl Strategy<Value = (Vec<(Option<u8>, Option<i64>)>, Vec<(Option<u8>, Option<i64>)>)> {
    prop::collection::vec(
        (
            prop::option::weighted(0.9, 0u8..5),
            prop::option::weighted(0.9, -1_000i64..1_000),
        ),
        0..80,
    )
    .prop_flat_map(|rows| (Just(rows.clone()), Just(rows).prop_shuffle()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Aggregates do not depend on input order or partition count.
    #[test]
    fn aggregate_is_order_and_partition_independent(
        (rows, shuffled) in rows_and_shuffle(),
        partitions in 1usize..8,
    ) {
        let spec = premiums_by_town();
        let baseline = aggregate(&silver_snapshot(&rows), &spec, 1).unwrap();
        let permuted = aggregate(&silver_snapshot(&shuffled), &spec, partitions).unwrap();
        prop_assert_eq!(&baseline, &permuted);

        let groups: HashSet<_> = rows.iter().map(|(town, _)| *town).collect();
        prop_assert_eq!(baseline.rows.len(), groups.len());
    }

    /// Rows kept by a drop expectation always satisfy it, and every input
    /// row is either kept or rejected.
    #[test]
    fn drop_expectation_filters_exactly(
        rows in prop::collection::vec((-50i64..50, 0i64..40), 0..60),
    ) {
        let schema = Schema::from_columns([
            ColumnSchema::new("current_premium", ColumnType::Integer),
            ColumnSchema::new("fixed_expenses", ColumnType::Integer),
        ]);
        let input: Vec<Record> = rows
            .iter()
            .map(|(p, e)| Record::new().with("current_premium", *p).with("fixed_expenses", *e))
            .collect();
        let spec = SilverSpec {
            table: "premiums_location".into(),
            join: None,
            derive: Vec::new(),
            constraints: vec![Constraint::from_expression(
                "valid premium",
                "current_premium > 0 AND current_premium > fixed_expenses",
                ViolationPolicy::Drop,
            )
            .unwrap()],
        };
        let ctx = EvalContext::new(NaiveDate::from_ymd_opt(2024, 6, 30).unwrap());
        let out = transform(&input, &schema, None, &spec, &ctx).unwrap();

        let expected = rows.iter().filter(|(p, e)| *p > 0 && p > e).count();
        prop_assert_eq!(out.evaluation.kept.len(), expected);
        prop_assert_eq!(out.evaluation.kept.len() + out.evaluation.rejected.len(), rows.len());
        for row in &out.evaluation.kept {
            let premium = row.get("current_premium").as_f64().unwrap();
            let expenses = row.get("fixed_expenses").as_f64().unwrap();
            prop_assert!(premium > 0.0 && premium > expenses);
        }
        prop_assert!(out.evaluation.failure("premiums_location").is_none());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Once a file is marked consumed, no later poll emits it again, and
    /// every poll emits exactly the files added since the last one.
    #[test]
    fn watermark_is_monotonic(rounds in prop::collection::vec(prop::collection::vec(1usize..5, 1..4), 1..4)) {
        let dir = tempfile::tempdir().unwrap();
        let state: Arc<dyn StateBackend> = Arc::new(SqliteStateBackend::in_memory().unwrap());
        let source: SourceConfig =
            serde_yaml::from_str(&format!("path: {}", dir.path().display())).unwrap();
        let pipeline = PipelineId::new("p");
        let table = TableName::new("cgr_premiums");
        let watcher = SourceWatcher::new(pipeline.clone(), table.clone(), source, Arc::clone(&state));

        let mut consumed = HashSet::new();
        for (round, files) in rounds.iter().enumerate() {
            let mut expected_rows = 0;
            for (i, rows) in files.iter().enumerate() {
                let mut body = String::from("customer_id\n");
                for r in 0..*rows {
                    body.push_str(&format!("{r}\n"));
                }
                fs::write(dir.path().join(format!("r{round}_f{i}.csv")), body).unwrap();
                expected_rows += rows;
            }

            let batch = watcher.poll().unwrap();
            prop_assert_eq!(batch.files.len(), files.len());
            prop_assert_eq!(batch.record_count(), expected_rows as u64);
            for file in &batch.files {
                prop_assert!(consumed.insert(file.entry.path.clone()));
            }
            state
                .mark_files_processed(&pipeline, &table, &batch.watermark_entries())
                .unwrap();
            prop_assert!(watcher.poll().unwrap().is_empty());
        }
    }
}
