//! Input loading tests (CSV and SQLite)

use meterrisk_core::aggregate::{aggregate_periods, AggregationFrequency};
use meterrisk_core::error::PipelineError;
use meterrisk_core::inputs;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("failed to write test file");
    path
}

fn is_schema(err: &PipelineError) -> bool {
    matches!(err, PipelineError::SchemaViolation { .. })
}

fn is_missing(err: &PipelineError) -> bool {
    matches!(err, PipelineError::MissingUpstreamInput { .. })
}

#[test]
fn test_fixtures_load() {
    let consumption = inputs::load_consumption_csv(&fixture("consumption.csv")).unwrap();
    assert_eq!(consumption.len(), 180);

    let clusters = inputs::load_cluster_assignments(&fixture("clusters.csv")).unwrap();
    assert_eq!(clusters.len(), 6);

    let latent = inputs::load_latent_vectors(&fixture("latent.csv")).unwrap();
    assert_eq!(latent.len(), 6);
    assert!(latent.iter().all(|v| v.values.len() == 3));

    let physical = inputs::load_physical_features(&fixture("physical.csv")).unwrap();
    assert_eq!(physical.len(), 6);
}

#[test]
fn test_daily_rows_sum_into_periods() {
    let consumption = inputs::load_consumption_csv(&fixture("consumption.csv")).unwrap();
    let series = aggregate_periods(&consumption, AggregationFrequency::Monthly);

    // 5 meters x 18 months, two readings per month
    assert_eq!(series.len(), 90);
    let first = series
        .iter()
        .find(|s| s.meter_id.as_str() == "M001")
        .unwrap();
    assert!((first.aggregated_volume - 12.0).abs() < 1e-9);
}

#[test]
fn test_missing_file_is_missing_input() {
    let temp = TempDir::new().expect("failed to create temp directory");
    let err = inputs::load_latent_vectors(&temp.path().join("nope.csv")).unwrap_err();
    assert!(is_missing(&err));
}

#[test]
fn test_missing_column_is_schema_violation() {
    let temp = TempDir::new().expect("failed to create temp directory");
    let path = write(temp.path(), "physical.csv", "meter_id,age\nA,3\n");
    let err = inputs::load_physical_features(&path).unwrap_err();
    assert!(is_schema(&err));
    assert!(err.to_string().contains("canya"));
}

#[test]
fn test_negative_volume_is_schema_violation() {
    let temp = TempDir::new().expect("failed to create temp directory");
    let path = write(
        temp.path(),
        "consumption.csv",
        "meter_id,date,volume\nA,2023-01-01,3.0\nA,2023-01-02,-1.0\n",
    );
    let err = inputs::load_consumption_csv(&path).unwrap_err();
    assert!(is_schema(&err));
    assert!(err.to_string().contains("line 3"));
}

#[test]
fn test_bad_date_is_schema_violation() {
    let temp = TempDir::new().expect("failed to create temp directory");
    let path = write(
        temp.path(),
        "consumption.csv",
        "meter_id,date,volume\nA,yesterday,3.0\n",
    );
    assert!(is_schema(&inputs::load_consumption_csv(&path).unwrap_err()));
}

#[test]
fn test_empty_consumption_is_allowed() {
    let temp = TempDir::new().expect("failed to create temp directory");
    let path = write(temp.path(), "consumption.csv", "meter_id,date,volume\n");
    assert!(inputs::load_consumption_csv(&path).unwrap().is_empty());
}

#[test]
fn test_empty_latent_is_missing_input() {
    let temp = TempDir::new().expect("failed to create temp directory");
    let path = write(temp.path(), "latent.csv", "meter_id,z_1,z_2\n");
    assert!(is_missing(&inputs::load_latent_vectors(&path).unwrap_err()));
}

#[test]
fn test_latent_columns_follow_numeric_order() {
    let temp = TempDir::new().expect("failed to create temp directory");
    let path = write(
        temp.path(),
        "latent.csv",
        "z_10,meter_id,z_2,z_1\n10.0,A,2.0,1.0\n",
    );
    let latent = inputs::load_latent_vectors(&path).unwrap();
    assert_eq!(latent[0].values, vec![1.0, 2.0, 10.0]);
}

#[test]
fn test_duplicate_assignment_is_schema_violation() {
    let temp = TempDir::new().expect("failed to create temp directory");
    let path = write(
        temp.path(),
        "clusters.csv",
        "meter_id,cluster_label\nA,1\nB,2\nA,3\n",
    );
    assert!(is_schema(&inputs::load_cluster_assignments(&path).unwrap_err()));
}

fn create_db(path: &Path, table: &str, rows: &[(&str, &str, f64)]) {
    let conn = Connection::open(path).expect("failed to open database");
    conn.execute(
        &format!(
            "CREATE TABLE {} (meter_id TEXT, date TEXT, volume REAL)",
            table
        ),
        [],
    )
    .expect("failed to create table");
    for (meter_id, date, volume) in rows {
        conn.execute(
            &format!("INSERT INTO {} (meter_id, date, volume) VALUES (?1, ?2, ?3)", table),
            params![meter_id, date, volume],
        )
        .expect("failed to insert row");
    }
}

#[test]
fn test_sqlite_consumption_loads() {
    let temp = TempDir::new().expect("failed to create temp directory");
    let db = temp.path().join("meters.db");
    create_db(
        &db,
        "daily_reads",
        &[
            ("A", "2023-01-01", 2.5),
            ("A", "2023-01-02 08:00:00", 1.5),
            ("B", "2023-02-01", 4.0),
        ],
    );

    let records = inputs::load_consumption_sqlite(&db, "daily_reads").unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[1].date.to_string(), "2023-01-02");
    assert!((records[2].volume - 4.0).abs() < 1e-12);
}

#[test]
fn test_sqlite_missing_table_is_missing_input() {
    let temp = TempDir::new().expect("failed to create temp directory");
    let db = temp.path().join("meters.db");
    create_db(&db, "consumption", &[("A", "2023-01-01", 1.0)]);

    let err = inputs::load_consumption_sqlite(&db, "readings").unwrap_err();
    assert!(is_missing(&err));
}

#[test]
fn test_sqlite_rejects_unsafe_table_name() {
    let temp = TempDir::new().expect("failed to create temp directory");
    let db = temp.path().join("meters.db");
    create_db(&db, "consumption", &[("A", "2023-01-01", 1.0)]);

    let err = inputs::load_consumption_sqlite(&db, "consumption; DROP TABLE x").unwrap_err();
    assert!(is_schema(&err));
}

#[test]
fn test_sqlite_negative_volume_is_schema_violation() {
    let temp = TempDir::new().expect("failed to create temp directory");
    let db = temp.path().join("meters.db");
    create_db(&db, "consumption", &[("A", "2023-01-01", -2.0)]);

    let err = inputs::load_consumption_sqlite(&db, "consumption").unwrap_err();
    assert!(is_schema(&err));
}
