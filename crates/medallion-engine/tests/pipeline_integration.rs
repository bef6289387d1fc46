//! End-to-end tests: fixture landing files through bronze, silver, and
//! gold with real on-disk tables and a file-backed state database.

use std::fs;
use std::path::{Path, PathBuf};

use medallion_engine::config::parse_pipeline_str;
use medallion_engine::{validate_pipeline, Pipeline, PipelineConfig, StageOutcome};
use medallion_types::state::{PipelineId, TableName, TriggerOutcome};
use medallion_types::{ColumnType, Value};

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn copy_dir(from: &Path, to: &Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), target).unwrap();
        }
    }
}

/// Temp workspace with the fixture landing zone and a config pointing at it.
fn workspace() -> (tempfile::TempDir, PipelineConfig) {
    let dir = tempfile::tempdir().unwrap();
    copy_dir(&fixtures().join("landing"), &dir.path().join("landing"));
    let yaml = fs::read_to_string(fixtures().join("vehicle_premiums.yaml"))
        .unwrap()
        .replace("__ROOT__", dir.path().to_str().unwrap());
    let config = parse_pipeline_str(&yaml).unwrap();
    validate_pipeline(&config).expect("fixture pipeline should validate");
    (dir, config)
}

fn towns(pipeline: &Pipeline) -> Vec<(Value, Value, Value)> {
    pipeline
        .store()
        .snapshot("premiums_by_town")
        .unwrap()
        .rows()
        .iter()
        .map(|r| {
            (
                r.get("town").clone(),
                r.get("average_premium").clone(),
                r.get("number_of_customers").clone(),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_fixture_pipeline_end_to_end() {
    let (_dir, config) = workspace();
    let pipeline = Pipeline::open(config).unwrap();
    let report = pipeline.run_once(false).await.unwrap();
    assert_eq!(report.outcome(), TriggerOutcome::PartialSuccess);

    let definitions = pipeline.store().snapshot("cgr_definitions").unwrap();
    assert_eq!(definitions.len(), 5);
    assert_eq!(
        definitions.schema().names().collect::<Vec<_>>(),
        ["field", "description", "unit"]
    );

    // Bronze holds every parseable row; the truncated row is counted apart.
    let bronze = report.stage("cgr_premiums").unwrap();
    assert_eq!(bronze.stats.records_out, 7);
    assert_eq!(bronze.stats.parse_errors, 1);
    assert_eq!(pipeline.store().snapshot("cgr_premiums").unwrap().len(), 7);
    let schema = pipeline.store().snapshot("cgr_premiums").unwrap().schema().clone();
    assert_eq!(schema.column_type("birthdate"), Some(ColumnType::Date));
    assert_eq!(schema.column_type("current_premium"), Some(ColumnType::Integer));

    // Silver: ages and premiums are within bounds for every kept row.
    let silver = pipeline.store().snapshot("premiums_location").unwrap();
    assert_eq!(silver.len(), 5);
    for row in silver.rows() {
        let age = row.get("customer_age").as_f64().unwrap();
        assert!(age > 0.0 && age < 100.0);
        let premium = row.get("current_premium").as_f64().unwrap();
        let expenses = row.get("fixed_expenses").as_f64().unwrap();
        assert!(premium > 0.0 && premium > expenses);
    }

    // Left join: the unmatched territory yields one row with null columns.
    let unmatched: Vec<_> = silver
        .rows()
        .iter()
        .filter(|r| r.get("territory") == &Value::from("TERR9"))
        .collect();
    assert_eq!(unmatched.len(), 1);
    for column in ["county", "county_code", "zipcode", "town", "area"] {
        assert!(unmatched[0].get(column).is_null(), "{column} should be null");
    }
    let matched: Vec<_> = silver
        .rows()
        .iter()
        .filter(|r| r.get("customer_id") == &Value::Integer(3))
        .collect();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].get("county"), &Value::from("CountyB"));
    assert_eq!(matched[0].get("county_code"), &Value::from("CB"));
    assert_eq!(matched[0].get("zipcode"), &Value::Integer(4700));
    assert_eq!(matched[0].get("town"), &Value::from("Braga"));
    assert_eq!(matched[0].get("area"), &Value::from("suburban"));
    assert_eq!(silver.schema().column_type("zipcode"), Some(ColumnType::Integer));

    assert_eq!(
        towns(&pipeline),
        vec![
            (Value::from("Porto"), Value::Float(600.0), Value::Integer(2)),
            (Value::from("Faro"), Value::Float(550.0), Value::Integer(1)),
            (Value::from("Braga"), Value::Float(300.0), Value::Integer(1)),
            (Value::Null, Value::Float(250.0), Value::Integer(1)),
        ]
    );

    let counts = pipeline
        .state()
        .violation_counts(
            &PipelineId::new("vehicle_premiums"),
            &TableName::new("premiums_location"),
        )
        .unwrap();
    assert_eq!(
        counts,
        vec![("valid age".to_string(), 1), ("valid premium".to_string(), 1)]
    );
}

#[tokio::test]
async fn test_invalid_premiums_are_dropped_and_gold_is_empty() {
    let (dir, config) = workspace();
    let landing = dir.path().join("landing/premiums");
    fs::remove_file(landing.join("premiums_2024_05.csv")).unwrap();
    fs::write(
        landing.join("premiums.csv"),
        "customer_id,birthdate,territory,current_premium,fixed_expenses\n\
         1,1874-01-01,TERR1,500,100\n\
         2,1984-01-01,TERR2,50,100\n",
    )
    .unwrap();

    let pipeline = Pipeline::open(config).unwrap();
    let report = pipeline.run_once(false).await.unwrap();

    let silver = report.stage("premiums_location").unwrap();
    assert_eq!(silver.stats.records_in, 2);
    assert_eq!(silver.stats.records_dropped, 2);
    assert_eq!(
        silver.outcome,
        StageOutcome::Completed(TriggerOutcome::PartialSuccess)
    );
    assert!(pipeline.store().snapshot("premiums_location").unwrap().is_empty());
    assert!(pipeline.store().snapshot("premiums_by_town").unwrap().is_empty());
}

#[tokio::test]
async fn test_new_files_are_consumed_exactly_once() {
    let (dir, config) = workspace();
    let pipeline = Pipeline::open(config).unwrap();
    pipeline.run_once(false).await.unwrap();

    fs::write(
        dir.path().join("landing/premiums/premiums_2024_06.csv"),
        "customer_id,birthdate,territory,current_premium,fixed_expenses\n\
         9,1970-01-01,TERR2,700,100\n",
    )
    .unwrap();

    let report = pipeline.run_once(false).await.unwrap();
    assert_eq!(
        report.stage("territory_definitions").unwrap().outcome,
        StageOutcome::Skipped
    );
    let bronze = report.stage("cgr_premiums").unwrap();
    assert_eq!(bronze.stats.files_processed, 1);
    assert_eq!(bronze.stats.records_in, 1);
    // Only the appended bronze row flows through silver.
    assert_eq!(report.stage("premiums_location").unwrap().stats.records_in, 1);
    assert_eq!(pipeline.store().snapshot("cgr_premiums").unwrap().len(), 8);
    assert_eq!(pipeline.store().snapshot("premiums_location").unwrap().len(), 6);
    assert_eq!(
        towns(&pipeline)[2],
        (Value::from("Braga"), Value::Float(500.0), Value::Integer(2))
    );

    let report = pipeline.run_once(false).await.unwrap();
    assert!(report
        .stages
        .iter()
        .all(|s| s.outcome == StageOutcome::Skipped));
    assert_eq!(pipeline.store().snapshot("cgr_premiums").unwrap().len(), 8);
}

#[tokio::test]
async fn test_full_refresh_reproduces_identical_gold() {
    let (_dir, config) = workspace();
    let pipeline = Pipeline::open(config).unwrap();
    pipeline.run_once(false).await.unwrap();
    let before = pipeline
        .store()
        .snapshot("premiums_by_town")
        .unwrap()
        .to_record_batch()
        .unwrap();

    let report = pipeline.run_once(true).await.unwrap();
    assert!(report
        .stages
        .iter()
        .all(|s| matches!(s.outcome, StageOutcome::Completed(_))));
    assert_eq!(pipeline.store().snapshot("cgr_premiums").unwrap().len(), 7);
    let after = pipeline.store().snapshot("premiums_by_town").unwrap();
    assert_eq!(after.to_record_batch().unwrap(), before);
    assert_eq!(after.version(), 2);
}

#[tokio::test]
async fn test_state_and_tables_survive_restart() {
    let (dir, config) = workspace();
    {
        let pipeline = Pipeline::open(config.clone()).unwrap();
        pipeline.run_once(false).await.unwrap();
    }

    let pipeline = Pipeline::open(config).unwrap();
    let report = pipeline.run_once(false).await.unwrap();
    assert!(report
        .stages
        .iter()
        .all(|s| s.outcome == StageOutcome::Skipped));

    let silver = pipeline.store().snapshot("premiums_location").unwrap();
    assert_eq!(silver.len(), 5);
    assert_eq!(
        silver.schema().column_type("birthdate"),
        Some(ColumnType::Date)
    );
    assert_eq!(towns(&pipeline).len(), 4);
    assert!(dir.path().join("state.db").is_file());
    assert!(dir.path().join("tables/premiums_by_town/_schema.json").is_file());

    let runs = pipeline
        .state()
        .list_runs(&PipelineId::new("vehicle_premiums"), None, 10)
        .unwrap();
    assert_eq!(runs.len(), 5);
}

#[tokio::test]
async fn test_schema_change_under_fail_policy_halts_downstream() {
    let (dir, config) = workspace();
    let yaml = fs::read_to_string(fixtures().join("vehicle_premiums.yaml"))
        .unwrap()
        .replace("__ROOT__", dir.path().to_str().unwrap())
        .replace("type_change: coerce", "type_change: fail");
    let strict = parse_pipeline_str(&yaml).unwrap();
    assert_eq!(strict.pipeline, config.pipeline);

    let pipeline = Pipeline::open(strict).unwrap();
    pipeline.run_once(false).await.unwrap();

    fs::write(
        dir.path().join("landing/premiums/premiums_2024_06.csv"),
        "customer_id,birthdate,territory,current_premium,fixed_expenses\n\
         9,unknown,TERR2,700,100\n",
    )
    .unwrap();
    let report = pipeline.run_once(false).await.unwrap();
    assert!(matches!(
        report.stage("cgr_premiums").unwrap().outcome,
        StageOutcome::Failed { .. }
    ));
    assert_eq!(
        report.stage("premiums_location").unwrap().outcome,
        StageOutcome::Blocked {
            upstream: "cgr_premiums".into()
        }
    );
    assert_eq!(pipeline.store().snapshot("cgr_premiums").unwrap().len(), 7);

    // The failed batch was not marked consumed: it is retried after reset.
    fs::write(
        dir.path().join("landing/premiums/premiums_2024_06.csv"),
        "customer_id,birthdate,territory,current_premium,fixed_expenses\n\
         9,1970-01-01,TERR2,700,100\n",
    )
    .unwrap();
    pipeline.reset("cgr_premiums", false).await.unwrap();
    let report = pipeline.run_once(false).await.unwrap();
    assert!(matches!(
        report.stage("premiums_by_town").unwrap().outcome,
        StageOutcome::Completed(_)
    ));
    assert_eq!(pipeline.store().snapshot("cgr_premiums").unwrap().len(), 8);
}

#[tokio::test]
async fn test_column_blank_in_first_file_takes_type_of_later_values() {
    let (dir, config) = workspace();
    let landing = dir.path().join("landing/premiums");
    fs::remove_file(landing.join("premiums_2024_05.csv")).unwrap();
    fs::write(
        landing.join("a.csv"),
        "customer_id,birthdate,territory,current_premium,fixed_expenses\n\
         1,1980-01-01,TERR1,500,\n",
    )
    .unwrap();

    let pipeline = Pipeline::open(config).unwrap();
    pipeline.run_once(false).await.unwrap();
    // Unknown comparison against a null counts as a violation.
    assert!(pipeline.store().snapshot("premiums_location").unwrap().is_empty());

    fs::write(
        landing.join("b.csv"),
        "customer_id,birthdate,territory,current_premium,fixed_expenses\n\
         2,1980-01-01,TERR1,500,100\n",
    )
    .unwrap();
    pipeline.run_once(false).await.unwrap();

    let bronze = pipeline.store().snapshot("cgr_premiums").unwrap();
    assert_eq!(
        bronze.schema().column_type("fixed_expenses"),
        Some(ColumnType::Integer)
    );
    assert!(bronze.rows()[0].get("fixed_expenses").is_null());
    assert_eq!(bronze.rows()[1].get("fixed_expenses"), &Value::Integer(100));

    let silver = pipeline.store().snapshot("premiums_location").unwrap();
    assert_eq!(silver.len(), 1);
    assert_eq!(silver.rows()[0].get("customer_id"), &Value::Integer(2));
}

#[tokio::test]
async fn test_widened_join_key_matches_same_before_and_after_restart() {
    let (dir, config) = workspace();
    fs::write(
        dir.path().join("landing/territories/numeric_territories.csv"),
        "territory,county,county_code,zipcode,town,area\n1,CountyZ,CZ,1000,Lisboa,urban\n",
    )
    .unwrap();
    let landing = dir.path().join("landing/premiums");
    fs::remove_file(landing.join("premiums_2024_05.csv")).unwrap();
    fs::write(
        landing.join("p1.csv"),
        "customer_id,birthdate,territory,current_premium,fixed_expenses\n\
         1,1980-01-01,1,500,100\n",
    )
    .unwrap();

    let pipeline = Pipeline::open(config.clone()).unwrap();
    pipeline.run_once(false).await.unwrap();
    fs::write(
        landing.join("p2.csv"),
        "customer_id,birthdate,territory,current_premium,fixed_expenses\n\
         2,1980-01-01,TERR3,500,100\n",
    )
    .unwrap();
    pipeline.run_once(false).await.unwrap();

    let bronze = pipeline.store().snapshot("cgr_premiums").unwrap();
    assert_eq!(bronze.schema().column_type("territory"), Some(ColumnType::String));
    assert_eq!(bronze.rows()[0].get("territory"), &Value::from("1"));

    let town = |pipeline: &Pipeline| {
        pipeline
            .store()
            .snapshot("premiums_location")
            .unwrap()
            .rows()
            .iter()
            .find(|r| r.get("customer_id") == &Value::Integer(1))
            .map(|r| r.get("town").clone())
    };
    let in_process = town(&pipeline);
    assert_eq!(in_process, Some(Value::from("Lisboa")));
    drop(pipeline);

    let reopened = Pipeline::open(config).unwrap();
    assert_eq!(
        reopened.store().snapshot("cgr_premiums").unwrap().rows(),
        bronze.rows()
    );
    assert_eq!(town(&reopened), in_process);
}
