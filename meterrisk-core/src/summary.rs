//! Per-cluster summary views
//!
//! Computes derived aggregates from the risk table without modifying it.
//!
//! Global invariants enforced:
//! - Aggregates are strictly derived (never stored, always computed)
//! - Deterministic ordering
//! - No modification of existing risk records

use crate::combine::RiskRecord;
use crate::stats::{mean, median, sample_std};
use crate::types::ClusterId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Five-number view of one percentage column
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ColumnStats {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
}

impl ColumnStats {
    fn from_values(values: &[f64]) -> Self {
        ColumnStats {
            mean: mean(values).unwrap_or(0.0),
            std: sample_std(values),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            median: median(values).unwrap_or(0.0),
        }
    }
}

/// Cluster-level aggregates
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ClusterSummary {
    pub cluster_id: ClusterId,
    pub n_meters: usize,
    pub risk: ColumnStats,
    pub risk_base: ColumnStats,
    pub subcount: ColumnStats,
    pub anomaly_mean: f64,
    pub anomaly_std: f64,
    pub cluster_degradation: f64,
}

#[derive(Default)]
struct ClusterColumns {
    risk: Vec<f64>,
    risk_base: Vec<f64>,
    subcount: Vec<f64>,
    anomaly: Vec<f64>,
    degradation: f64,
}

/// Summarise the risk table per cluster, highest mean risk first
pub fn compute_cluster_summaries(records: &[RiskRecord]) -> Vec<ClusterSummary> {
    let mut cluster_data: HashMap<ClusterId, ClusterColumns> = HashMap::new();

    for record in records {
        let entry = cluster_data.entry(record.cluster_id).or_default();
        entry.risk.push(record.risk_percent);
        entry.risk_base.push(record.risk_percent_base);
        entry.subcount.push(record.subcount_percent);
        entry.anomaly.push(record.anomaly_score);
        entry.degradation = record.cluster_degradation;
    }

    let mut summaries: Vec<ClusterSummary> = cluster_data
        .into_iter()
        .map(|(cluster_id, cols)| ClusterSummary {
            cluster_id,
            n_meters: cols.risk.len(),
            risk: ColumnStats::from_values(&cols.risk),
            risk_base: ColumnStats::from_values(&cols.risk_base),
            subcount: ColumnStats::from_values(&cols.subcount),
            anomaly_mean: mean(&cols.anomaly).unwrap_or(0.0),
            anomaly_std: sample_std(&cols.anomaly),
            cluster_degradation: cols.degradation,
        })
        .collect();

    // Risk mean descending, then cluster id ascending
    summaries.sort_by(|a, b| {
        b.risk
            .mean
            .partial_cmp(&a.risk.mean)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.cluster_id.cmp(&b.cluster_id))
    });

    summaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MeterId;

    fn record(id: &str, cluster_id: ClusterId, risk: f64, base: f64) -> RiskRecord {
        RiskRecord {
            meter_id: MeterId::from(id),
            cluster_id,
            anomaly_score: base / 100.0,
            cluster_degradation: cluster_id as f64 / 10.0,
            subcount_score: 0.0,
            subcount_percent: 0.0,
            has_consumption_history: true,
            risk_percent_base: base,
            risk_percent: risk,
        }
    }

    #[test]
    fn test_cluster_statistics() {
        let records = vec![
            record("a", 1, 10.0, 10.0),
            record("b", 1, 20.0, 20.0),
            record("c", 1, 60.0, 30.0),
            record("d", 2, 90.0, 90.0),
        ];
        let summaries = compute_cluster_summaries(&records);
        assert_eq!(summaries.len(), 2);

        // Cluster 2 has the higher mean risk
        assert_eq!(summaries[0].cluster_id, 2);
        assert_eq!(summaries[0].n_meters, 1);
        assert_eq!(summaries[0].risk.std, 0.0);
        assert_eq!(summaries[0].cluster_degradation, 0.2);

        let c1 = &summaries[1];
        assert_eq!(c1.n_meters, 3);
        assert!((c1.risk.mean - 30.0).abs() < 1e-12);
        assert_eq!(c1.risk.min, 10.0);
        assert_eq!(c1.risk.max, 60.0);
        assert_eq!(c1.risk.median, 20.0);
        assert!((c1.risk.std - 700.0_f64.sqrt()).abs() < 1e-9);
        assert_eq!(c1.risk_base.median, 20.0);
    }

    #[test]
    fn test_ties_ordered_by_cluster_id() {
        let records = vec![record("a", 5, 40.0, 40.0), record("b", 3, 40.0, 40.0)];
        let summaries = compute_cluster_summaries(&records);
        assert_eq!(summaries[0].cluster_id, 3);
        assert_eq!(summaries[1].cluster_id, 5);
    }

    #[test]
    fn test_empty_table() {
        assert!(compute_cluster_summaries(&[]).is_empty());
    }
}
