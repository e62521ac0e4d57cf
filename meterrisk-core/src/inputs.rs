//! Upstream input tables
//!
//! CSV loaders for the four input tables and a SQLite loader for daily
//! consumption. Every loader validates its schema up front and returns a
//! fatal `PipelineError` on the first violation; nothing is partially loaded.
//!
//! Global invariants enforced:
//! - Required columns are checked before any row is parsed
//! - Volumes, ages and canya values are finite and non-negative
//! - Meter ids are unique in the cluster, latent and physical tables

use crate::error::{PipelineError, PipelineResult};
use crate::types::{
    ClusterAssignment, ClusterId, ConsumptionRecord, LatentVector, MeterId, PhysicalFeatures,
};
use chrono::{NaiveDate, NaiveDateTime};
use csv::{ReaderBuilder, StringRecord, Trim};
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use std::collections::BTreeSet;
use std::path::Path;

pub const CONSUMPTION_TABLE: &str = "consumption";
pub const CLUSTER_TABLE: &str = "cluster_assignments";
pub const LATENT_TABLE: &str = "latent_vectors";
pub const PHYSICAL_TABLE: &str = "physical_features";

/// Default table name for SQLite consumption sources
pub const DEFAULT_SQLITE_TABLE: &str = "consumption";

/// Prefix of latent-vector columns (`z_1 .. z_d`)
pub const LATENT_PREFIX: &str = "z_";

/// A CSV file with its header resolved
struct CsvTable {
    table: &'static str,
    headers: StringRecord,
    reader: csv::Reader<std::fs::File>,
}

impl CsvTable {
    fn open(path: &Path, table: &'static str) -> PipelineResult<Self> {
        if !path.is_file() {
            return Err(PipelineError::missing(
                table,
                format!("file not found: {}", path.display()),
            ));
        }
        let mut reader = ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(false)
            .from_path(path)?;
        let headers = reader.headers()?.clone();
        if headers.is_empty() {
            return Err(PipelineError::missing(
                table,
                format!("{} has no header row", path.display()),
            ));
        }
        Ok(CsvTable {
            table,
            headers,
            reader,
        })
    }

    /// Index of the first header matching one of `names`
    fn column(&self, names: &[&str]) -> PipelineResult<usize> {
        names
            .iter()
            .find_map(|name| self.headers.iter().position(|h| h == *name))
            .ok_or_else(|| {
                PipelineError::schema(
                    self.table,
                    format!(
                        "missing required column '{}' (found: {})",
                        names.join("' or '"),
                        self.headers.iter().collect::<Vec<_>>().join(", ")
                    ),
                )
            })
    }

    fn rows(&mut self) -> impl Iterator<Item = (usize, csv::Result<StringRecord>)> + '_ {
        // Line 1 is the header
        self.reader
            .records()
            .enumerate()
            .map(|(i, r)| (i + 2, r))
    }
}

fn field<'r>(
    table: &str,
    record: &'r StringRecord,
    idx: usize,
    line: usize,
) -> PipelineResult<&'r str> {
    record
        .get(idx)
        .ok_or_else(|| PipelineError::schema(table, format!("line {}: missing field", line)))
}

fn parse_meter_id(table: &str, raw: &str, line: usize) -> PipelineResult<MeterId> {
    if raw.is_empty() {
        return Err(PipelineError::schema(
            table,
            format!("line {}: empty meter_id", line),
        ));
    }
    Ok(MeterId::new(raw))
}

fn parse_non_negative(table: &str, column: &str, raw: &str, line: usize) -> PipelineResult<f64> {
    let value: f64 = raw.parse().map_err(|_| {
        PipelineError::schema(
            table,
            format!("line {}: {} '{}' is not a number", line, column, raw),
        )
    })?;
    if !value.is_finite() || value < 0.0 {
        return Err(PipelineError::schema(
            table,
            format!("line {}: {} must be finite and >= 0, got {}", line, column, value),
        ));
    }
    Ok(value)
}

/// Accept plain dates and date-times (the time part is dropped)
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|dt| dt.date())
}

fn parse_cluster_id(table: &str, raw: &str, line: usize) -> PipelineResult<ClusterId> {
    if let Ok(id) = raw.parse::<ClusterId>() {
        return Ok(id);
    }
    // Labels written as floats by upstream tooling ("3.0")
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() && v.fract() == 0.0 => Ok(v as ClusterId),
        _ => Err(PipelineError::schema(
            table,
            format!("line {}: cluster id '{}' is not an integer", line, raw),
        )),
    }
}

fn check_unique(
    table: &str,
    seen: &mut BTreeSet<MeterId>,
    id: &MeterId,
    line: usize,
) -> PipelineResult<()> {
    if !seen.insert(id.clone()) {
        return Err(PipelineError::schema(
            table,
            format!("line {}: duplicate meter_id {}", line, id),
        ));
    }
    Ok(())
}

fn require_rows<T>(table: &str, rows: Vec<T>, path: &Path) -> PipelineResult<Vec<T>> {
    if rows.is_empty() {
        return Err(PipelineError::missing(
            table,
            format!("{} contains no rows", path.display()),
        ));
    }
    Ok(rows)
}

/// Load `(meter_id, date, volume)` daily consumption from CSV.
///
/// An empty table is valid and yields no records.
pub fn load_consumption_csv(path: &Path) -> PipelineResult<Vec<ConsumptionRecord>> {
    let mut csv = CsvTable::open(path, CONSUMPTION_TABLE)?;
    let meter_col = csv.column(&["meter_id"])?;
    let date_col = csv.column(&["date"])?;
    let volume_col = csv.column(&["volume"])?;
    let table = csv.table;

    let mut records = Vec::new();
    for (line, row) in csv.rows() {
        let row = row?;
        let meter_id = parse_meter_id(table, field(table, &row, meter_col, line)?, line)?;
        let raw_date = field(table, &row, date_col, line)?;
        let date = parse_date(raw_date).ok_or_else(|| {
            PipelineError::schema(table, format!("line {}: invalid date '{}'", line, raw_date))
        })?;
        let raw_volume = field(table, &row, volume_col, line)?;
        let volume = parse_non_negative(table, "volume", raw_volume, line)?;
        records.push(ConsumptionRecord {
            meter_id,
            date,
            volume,
        });
    }

    log::info!(
        "loaded {} consumption record(s) from {}",
        records.len(),
        path.display()
    );
    Ok(records)
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

fn sql_text(value: Value) -> Option<String> {
    match value {
        Value::Text(s) => Some(s),
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(f) => Some(f.to_string()),
        Value::Null | Value::Blob(_) => None,
    }
}

/// Load daily consumption from a SQLite table with columns `meter_id, date, volume`
pub fn load_consumption_sqlite(
    path: &Path,
    table: &str,
) -> PipelineResult<Vec<ConsumptionRecord>> {
    if !path.is_file() {
        return Err(PipelineError::missing(
            CONSUMPTION_TABLE,
            format!("database not found: {}", path.display()),
        ));
    }
    if !is_identifier(table) {
        return Err(PipelineError::schema(
            CONSUMPTION_TABLE,
            format!("invalid table name '{}'", table),
        ));
    }

    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    if exists == 0 {
        return Err(PipelineError::missing(
            CONSUMPTION_TABLE,
            format!("table '{}' not found in {}", table, path.display()),
        ));
    }

    let mut stmt = conn
        .prepare(&format!("SELECT meter_id, date, volume FROM {}", table))
        .map_err(|e| PipelineError::schema(CONSUMPTION_TABLE, e.to_string()))?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, Value>(0)?,
            row.get::<_, Value>(1)?,
            row.get::<_, Value>(2)?,
        ))
    })?;

    let mut records = Vec::new();
    for (i, row) in rows.enumerate() {
        let (meter_id, date, volume) = row?;
        let line = i + 1;
        let meter_id = sql_text(meter_id).ok_or_else(|| {
            PipelineError::schema(CONSUMPTION_TABLE, format!("row {}: null meter_id", line))
        })?;
        let date = sql_text(date)
            .as_deref()
            .and_then(parse_date)
            .ok_or_else(|| {
                PipelineError::schema(CONSUMPTION_TABLE, format!("row {}: invalid date", line))
            })?;
        let volume = match volume {
            Value::Integer(v) => v as f64,
            Value::Real(v) => v,
            Value::Text(s) => parse_non_negative(CONSUMPTION_TABLE, "volume", &s, line)?,
            Value::Null | Value::Blob(_) => {
                return Err(PipelineError::schema(
                    CONSUMPTION_TABLE,
                    format!("row {}: volume is not numeric", line),
                ))
            }
        };
        if !volume.is_finite() || volume < 0.0 {
            return Err(PipelineError::schema(
                CONSUMPTION_TABLE,
                format!("row {}: volume must be finite and >= 0, got {}", line, volume),
            ));
        }
        records.push(ConsumptionRecord {
            meter_id: parse_meter_id(CONSUMPTION_TABLE, &meter_id, line)?,
            date,
            volume,
        });
    }

    log::info!(
        "loaded {} consumption record(s) from {}:{}",
        records.len(),
        path.display(),
        table
    );
    Ok(records)
}

/// Load `(meter_id, cluster_id)`; `cluster_label` is accepted as the id column
pub fn load_cluster_assignments(path: &Path) -> PipelineResult<Vec<ClusterAssignment>> {
    let mut csv = CsvTable::open(path, CLUSTER_TABLE)?;
    let meter_col = csv.column(&["meter_id"])?;
    let cluster_col = csv.column(&["cluster_id", "cluster_label"])?;
    let table = csv.table;

    let mut seen = BTreeSet::new();
    let mut assignments = Vec::new();
    for (line, row) in csv.rows() {
        let row = row?;
        let meter_id = parse_meter_id(table, field(table, &row, meter_col, line)?, line)?;
        check_unique(table, &mut seen, &meter_id, line)?;
        let cluster_id = parse_cluster_id(table, field(table, &row, cluster_col, line)?, line)?;
        assignments.push(ClusterAssignment {
            meter_id,
            cluster_id,
        });
    }

    let assignments = require_rows(table, assignments, path)?;
    log::info!("loaded {} cluster assignment(s)", assignments.len());
    Ok(assignments)
}

/// Numeric suffix of a latent column name (`z_12` → 12)
fn latent_index(name: &str) -> Option<u32> {
    name.strip_prefix(LATENT_PREFIX)?.parse().ok()
}

/// Load `(meter_id, z_1 .. z_d)`; latent columns are ordered by numeric suffix
pub fn load_latent_vectors(path: &Path) -> PipelineResult<Vec<LatentVector>> {
    let mut csv = CsvTable::open(path, LATENT_TABLE)?;
    let meter_col = csv.column(&["meter_id"])?;
    let table = csv.table;

    let mut latent_cols: Vec<(u32, usize)> = Vec::new();
    for (idx, name) in csv.headers.iter().enumerate() {
        if name.starts_with(LATENT_PREFIX) {
            let order = latent_index(name).ok_or_else(|| {
                PipelineError::schema(
                    table,
                    format!("latent column '{}' has no numeric suffix", name),
                )
            })?;
            latent_cols.push((order, idx));
        }
    }
    if latent_cols.is_empty() {
        return Err(PipelineError::schema(
            table,
            format!("no '{}*' columns", LATENT_PREFIX),
        ));
    }
    latent_cols.sort();

    let mut seen = BTreeSet::new();
    let mut vectors = Vec::new();
    for (line, row) in csv.rows() {
        let row = row?;
        let meter_id = parse_meter_id(table, field(table, &row, meter_col, line)?, line)?;
        check_unique(table, &mut seen, &meter_id, line)?;
        let mut values = Vec::with_capacity(latent_cols.len());
        for (_, idx) in &latent_cols {
            let raw = field(table, &row, *idx, line)?;
            let value: f64 = raw.parse().map_err(|_| {
                PipelineError::schema(
                    table,
                    format!("line {}: latent value '{}' is not a number", line, raw),
                )
            })?;
            if !value.is_finite() {
                return Err(PipelineError::schema(
                    table,
                    format!("line {}: latent value is not finite", line),
                ));
            }
            values.push(value);
        }
        vectors.push(LatentVector { meter_id, values });
    }

    let vectors = require_rows(table, vectors, path)?;
    log::info!(
        "loaded {} latent vector(s) of dimension {}",
        vectors.len(),
        latent_cols.len()
    );
    Ok(vectors)
}

/// Load `(meter_id, age, canya)`
pub fn load_physical_features(path: &Path) -> PipelineResult<Vec<PhysicalFeatures>> {
    let mut csv = CsvTable::open(path, PHYSICAL_TABLE)?;
    let meter_col = csv.column(&["meter_id"])?;
    let age_col = csv.column(&["age"])?;
    let canya_col = csv.column(&["canya"])?;
    let table = csv.table;

    let mut seen = BTreeSet::new();
    let mut features = Vec::new();
    for (line, row) in csv.rows() {
        let row = row?;
        let meter_id = parse_meter_id(table, field(table, &row, meter_col, line)?, line)?;
        check_unique(table, &mut seen, &meter_id, line)?;
        let age = parse_non_negative(table, "age", field(table, &row, age_col, line)?, line)?;
        let raw_canya = field(table, &row, canya_col, line)?;
        let canya = parse_non_negative(table, "canya", raw_canya, line)?;
        features.push(PhysicalFeatures {
            meter_id,
            age,
            canya,
        });
    }

    let features = require_rows(table, features, path)?;
    log::info!("loaded physical features for {} meter(s)", features.len());
    Ok(features)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date_variants() {
        let d = NaiveDate::from_ymd_opt(2023, 4, 5).unwrap();
        assert_eq!(parse_date("2023-04-05"), Some(d));
        assert_eq!(parse_date("2023-04-05 13:45:00"), Some(d));
        assert_eq!(parse_date("2023-04-05T00:00:00"), Some(d));
        assert_eq!(parse_date("05/04/2023"), None);
    }

    #[test]
    fn test_cluster_id_accepts_integral_floats() {
        assert_eq!(parse_cluster_id("t", "3", 2).unwrap(), 3);
        assert_eq!(parse_cluster_id("t", "-1", 2).unwrap(), -1);
        assert_eq!(parse_cluster_id("t", "3.0", 2).unwrap(), 3);
        assert!(parse_cluster_id("t", "3.5", 2).is_err());
        assert!(parse_cluster_id("t", "x", 2).is_err());
    }

    #[test]
    fn test_latent_index_orders_numerically() {
        let mut names = vec!["z_10", "z_2", "z_1"];
        names.sort_by_key(|n| latent_index(n));
        assert_eq!(names, vec!["z_1", "z_2", "z_10"]);
        assert_eq!(latent_index("z_a"), None);
    }

    #[test]
    fn test_identifier_check() {
        assert!(is_identifier("consumption"));
        assert!(is_identifier("daily_2023"));
        assert!(!is_identifier("x; DROP TABLE y"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn test_negative_value_rejected() {
        let err = parse_non_negative("t", "volume", "-1.5", 3).unwrap_err();
        assert!(matches!(err, PipelineError::SchemaViolation { .. }));
        assert_eq!(parse_non_negative("t", "volume", "0", 3).unwrap(), 0.0);
    }
}
