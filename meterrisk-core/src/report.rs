//! Reporting and output generation
//!
//! Global invariants enforced:
//! - Deterministic output ordering
//! - Byte-for-byte identical output across runs
//! - Files are written whole (temp file + rename) or not at all

use crate::combine::RiskRecord;
use crate::risk::{assign_status, RiskStatus, StatusThresholds};
use crate::subcount::SubcountingMetrics;
use crate::summary::ClusterSummary;
use anyhow::{Context, Result};
use serde::Serialize;
use std::cmp::Ordering;
use std::path::Path;

/// Risk row as presented to readers, with its status bucket
#[derive(Debug, Clone, Serialize)]
pub struct RiskRow<'a> {
    #[serde(flatten)]
    pub record: &'a RiskRecord,
    pub status: RiskStatus,
}

/// Attach a status to every record
pub fn with_status<'a>(
    records: &'a [RiskRecord],
    thresholds: &StatusThresholds,
) -> Vec<RiskRow<'a>> {
    records
        .iter()
        .map(|record| RiskRow {
            record,
            status: assign_status(record.risk_percent, thresholds),
        })
        .collect()
}

/// Sort records deterministically
pub fn sort_records(mut records: Vec<RiskRecord>) -> Vec<RiskRecord> {
    records.sort_by(|a, b| {
        // 1. Final risk descending
        b.risk_percent
            .partial_cmp(&a.risk_percent)
            .unwrap_or(Ordering::Equal)
            // 2. Base risk descending
            .then_with(|| {
                b.risk_percent_base
                    .partial_cmp(&a.risk_percent_base)
                    .unwrap_or(Ordering::Equal)
            })
            // 3. Meter id ascending
            .then_with(|| a.meter_id.cmp(&b.meter_id))
    });
    records
}

/// Number of rows shown for `--top N` / `--top-percent P`.
///
/// `top_percent` wins when both are given; the result never exceeds `len`.
pub fn top_count(len: usize, top: Option<usize>, top_percent: Option<f64>) -> usize {
    if let Some(p) = top_percent {
        let p = p.clamp(0.0, 100.0);
        return ((len as f64 * p / 100.0).floor() as usize).min(len);
    }
    top.map(|n| n.min(len)).unwrap_or(len)
}

/// Render risk rows as text output
pub fn render_text(records: &[RiskRecord], thresholds: &StatusThresholds) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "{:<8} {:<8} {:<8} {:<8} {:<8} {}\n",
        "RISK%", "BASE%", "SUBC%", "STATUS", "CLUSTER", "METER"
    ));

    for row in with_status(records, thresholds) {
        let r = row.record;
        let subcount = if r.has_consumption_history {
            format!("{:.2}", r.subcount_percent)
        } else {
            "-".to_string()
        };
        output.push_str(&format!(
            "{:<8.2} {:<8.2} {:<8} {:<8} {:<8} {}\n",
            r.risk_percent,
            r.risk_percent_base,
            subcount,
            row.status.as_str(),
            r.cluster_id,
            r.meter_id,
        ));
    }

    output
}

/// Render the per-cluster summary as text output
pub fn render_summary_text(summaries: &[ClusterSummary]) -> String {
    let mut output = String::new();
    output.push_str(&format!(
        "{:<8} {:<8} {:<8} {:<8} {:<8} {:<8} {:<8} {}\n",
        "CLUSTER", "METERS", "MEAN%", "STD", "MIN%", "MAX%", "MEDIAN%", "DEGRADATION"
    ));
    for s in summaries {
        output.push_str(&format!(
            "{:<8} {:<8} {:<8.2} {:<8.2} {:<8.2} {:<8.2} {:<8.2} {:.3}\n",
            s.cluster_id,
            s.n_meters,
            s.risk.mean,
            s.risk.std,
            s.risk.min,
            s.risk.max,
            s.risk.median,
            s.cluster_degradation,
        ));
    }
    output
}

/// Render subcounting metrics as text output
pub fn render_subcounting_text(metrics: &[SubcountingMetrics]) -> String {
    let mut output = String::new();
    output.push_str(&format!(
        "{:<8} {:<8} {:<8} {:<8} {:<8} {:<8} {:<6} {}\n",
        "SCORE", "RAW", "R", "s_R", "s_T", "s_delta", "N", "METER"
    ));
    for m in metrics {
        output.push_str(&format!(
            "{:<8.3} {:<8.3} {:<8.3} {:<8.2} {:<8.2} {:<8.2} {:<6} {}{}\n",
            m.subcount_score,
            m.subcount_score_raw,
            m.drop_ratio,
            m.s_ratio,
            m.s_trend,
            m.s_delta,
            m.n_periods,
            m.meter_id,
            if m.low_confidence { " (low confidence)" } else { "" },
        ));
    }
    output
}

/// Render risk rows as JSON output
pub fn render_json(records: &[RiskRecord], thresholds: &StatusThresholds) -> String {
    serde_json::to_string_pretty(&with_status(records, thresholds))
        .unwrap_or_else(|_| "[]".to_string())
}

/// Render subcounting metrics as JSON output
pub fn render_subcounting_json(metrics: &[SubcountingMetrics]) -> String {
    serde_json::to_string_pretty(metrics).unwrap_or_else(|_| "[]".to_string())
}

/// Sort subcounting metrics by score descending, then meter id
pub fn sort_subcounting(mut metrics: Vec<SubcountingMetrics>) -> Vec<SubcountingMetrics> {
    metrics.sort_by(|a, b| {
        b.subcount_score
            .partial_cmp(&a.subcount_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.meter_id.cmp(&b.meter_id))
    });
    metrics
}

fn csv_string(wtr: csv::Writer<Vec<u8>>) -> Result<String> {
    let bytes = wtr
        .into_inner()
        .map_err(|e| anyhow::anyhow!("failed to flush CSV buffer: {}", e))?;
    String::from_utf8(bytes).context("CSV output is not valid UTF-8")
}

/// Risk table as CSV (one row per meter, every meter included)
pub fn risk_csv(records: &[RiskRecord], thresholds: &StatusThresholds) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record([
        "meter_id",
        "cluster_id",
        "anomaly_score",
        "cluster_degradation",
        "subcount_score",
        "subcount_percent",
        "has_consumption_history",
        "risk_percent_base",
        "risk_percent",
        "status",
    ])?;
    for row in with_status(records, thresholds) {
        let r = row.record;
        wtr.write_record([
            r.meter_id.to_string(),
            r.cluster_id.to_string(),
            format!("{:.6}", r.anomaly_score),
            format!("{:.6}", r.cluster_degradation),
            format!("{:.6}", r.subcount_score),
            format!("{:.4}", r.subcount_percent),
            r.has_consumption_history.to_string(),
            format!("{:.4}", r.risk_percent_base),
            format!("{:.4}", r.risk_percent),
            row.status.as_str().to_string(),
        ])?;
    }
    csv_string(wtr)
}

/// Cluster summary as CSV
pub fn summary_csv(summaries: &[ClusterSummary]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    let mut header = vec!["cluster_id".to_string(), "n_meters".to_string()];
    for prefix in ["risk", "risk_base", "subcount"] {
        for stat in ["mean", "std", "min", "max", "median"] {
            header.push(format!("{}_{}", prefix, stat));
        }
    }
    header.extend(
        ["anomaly_mean", "anomaly_std", "cluster_degradation"]
            .iter()
            .map(|s| s.to_string()),
    );
    wtr.write_record(&header)?;

    for s in summaries {
        let mut row = vec![s.cluster_id.to_string(), s.n_meters.to_string()];
        for stats in [&s.risk, &s.risk_base, &s.subcount] {
            for v in [stats.mean, stats.std, stats.min, stats.max, stats.median] {
                row.push(format!("{:.4}", v));
            }
        }
        row.push(format!("{:.6}", s.anomaly_mean));
        row.push(format!("{:.6}", s.anomaly_std));
        row.push(format!("{:.6}", s.cluster_degradation));
        wtr.write_record(&row)?;
    }
    csv_string(wtr)
}

/// Subcounting metrics as CSV
pub fn subcounting_csv(metrics: &[SubcountingMetrics]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    for m in metrics {
        wtr.serialize(m)?;
    }
    csv_string(wtr)
}

pub fn write_risk_csv(
    path: &Path,
    records: &[RiskRecord],
    thresholds: &StatusThresholds,
) -> Result<()> {
    atomic_write(path, &risk_csv(records, thresholds)?)
}

pub fn write_summary_csv(path: &Path, summaries: &[ClusterSummary]) -> Result<()> {
    atomic_write(path, &summary_csv(summaries)?)
}

pub fn write_subcounting_csv(path: &Path, metrics: &[SubcountingMetrics]) -> Result<()> {
    atomic_write(path, &subcounting_csv(metrics)?)
}

/// Atomically write `contents` to `path` (temp file + rename)
pub fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    use std::fs;
    use std::io::Write;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }

    let temp_path = path.with_extension("tmp");

    let mut file = fs::File::create(&temp_path)
        .with_context(|| format!("failed to create temp file: {}", temp_path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("failed to write to temp file: {}", temp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync temp file: {}", temp_path.display()))?;
    drop(file);

    fs::rename(&temp_path, path)
        .with_context(|| format!("failed to rename temp file to: {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MeterId;

    fn record(id: &str, risk: f64, base: f64) -> RiskRecord {
        RiskRecord {
            meter_id: MeterId::from(id),
            cluster_id: 1,
            anomaly_score: 0.5,
            cluster_degradation: 0.5,
            subcount_score: (risk - base) / 100.0,
            subcount_percent: risk - base,
            has_consumption_history: true,
            risk_percent_base: base,
            risk_percent: risk,
        }
    }

    #[test]
    fn test_sort_order() {
        let sorted = sort_records(vec![
            record("b", 50.0, 40.0),
            record("a", 50.0, 40.0),
            record("c", 90.0, 10.0),
            record("d", 50.0, 45.0),
        ]);
        let ids: Vec<&str> = sorted.iter().map(|r| r.meter_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "a", "b"]);
    }

    #[test]
    fn test_top_count() {
        assert_eq!(top_count(10, None, None), 10);
        assert_eq!(top_count(10, Some(3), None), 3);
        assert_eq!(top_count(2, Some(3), None), 2);
        assert_eq!(top_count(10, Some(3), Some(25.0)), 2);
        assert_eq!(top_count(10, None, Some(100.0)), 10);
        assert_eq!(top_count(10, None, Some(5.0)), 0);
    }

    #[test]
    fn test_render_text_has_status() {
        let text = render_text(
            &[record("m1", 85.0, 80.0), record("m2", 10.0, 10.0)],
            &StatusThresholds::default(),
        );
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("RISK%"));
        assert!(lines[1].contains("alert"));
        assert!(lines[1].ends_with("m1"));
        assert!(lines[2].contains("normal"));
    }

    #[test]
    fn test_render_json_flattens_record() {
        let json = render_json(&[record("m1", 60.0, 50.0)], &StatusThresholds::default());
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["meter_id"], "m1");
        assert_eq!(value[0]["status"], "warning");
        assert_eq!(value[0]["risk_percent"], 60.0);
    }

    #[test]
    fn test_risk_csv_columns() {
        let csv = risk_csv(&[record("m1", 60.0, 50.0)], &StatusThresholds::default()).unwrap();
        let mut lines = csv.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("meter_id,cluster_id,anomaly_score"));
        assert!(header.ends_with("risk_percent,status"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("m1,1,"));
        assert!(row.ends_with("60.0000,warning"));
    }

    #[test]
    fn test_atomic_write_replaces_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("out").join("risk.csv");
        atomic_write(&path, "first").unwrap();
        atomic_write(&path, "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!path.with_extension("tmp").exists());
    }
}
