//! Risk combination
//!
//! Base risk blends anomaly and degradation, rescaled across the population
//! into `p_cluster`. Subcounting then enters as an independent failure cause:
//! `p_final = 1 - (1 - p_cluster)(1 - γ·subcount_score)`.
//!
//! Global invariants enforced:
//! - `risk_percent >= risk_percent_base` for every meter
//! - Both percentages lie in [0, 100]
//! - A meter without subcounting metrics contributes `subcount_score = 0`

use crate::anomaly::AnomalyScore;
use crate::error::{Fallback, FallbackLog};
use crate::stats::min_max_normalize;
use crate::subcount::SubcountingMetrics;
use crate::types::{ClusterId, MeterId};
use serde::Serialize;
use std::collections::BTreeMap;

/// Stage name used in degenerate-normalisation fallbacks
pub const STAGE: &str = "base_risk";

/// Blend weights of the combiner
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CombinationWeights {
    /// Weight of `anomaly_score` in the base risk
    pub w1: f64,
    /// Weight of `cluster_degradation` in the base risk
    pub w2: f64,
    /// Cap on the independent subcounting contribution
    pub gamma: f64,
}

impl Default for CombinationWeights {
    fn default() -> Self {
        CombinationWeights {
            w1: 0.5,
            w2: 0.5,
            gamma: 0.8,
        }
    }
}

/// Final output row for one meter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskRecord {
    pub meter_id: MeterId,
    pub cluster_id: ClusterId,
    pub anomaly_score: f64,
    pub cluster_degradation: f64,
    pub subcount_score: f64,
    pub subcount_percent: f64,
    /// False when the meter had no normalised consumption periods
    pub has_consumption_history: bool,
    pub risk_percent_base: f64,
    pub risk_percent: f64,
}

/// Independent-events combination of base and subcounting probabilities.
///
/// Inputs are clamped to [0, 1]; the result is never below `p_cluster`.
pub fn combine_probability(p_cluster: f64, subcount_score: f64, gamma: f64) -> f64 {
    let p_cluster = p_cluster.clamp(0.0, 1.0);
    let p_sub = (gamma * subcount_score).clamp(0.0, 1.0);
    if p_sub == 0.0 {
        return p_cluster;
    }
    let p_final = 1.0 - (1.0 - p_cluster) * (1.0 - p_sub);
    p_final.clamp(p_cluster, 1.0)
}

/// Merge anomaly, degradation and subcounting into one record per meter.
///
/// `anomaly` defines the population and the output order. Every meter's
/// cluster must be present in `degradation`; a missing entry contributes 0.
pub fn combine_risk(
    anomaly: &[AnomalyScore],
    degradation: &BTreeMap<ClusterId, f64>,
    subcounting: &[SubcountingMetrics],
    weights: &CombinationWeights,
) -> (Vec<RiskRecord>, FallbackLog) {
    let subcount: BTreeMap<&MeterId, f64> = subcounting
        .iter()
        .map(|m| (&m.meter_id, m.subcount_score))
        .collect();

    let degr: Vec<f64> = anomaly
        .iter()
        .map(|a| degradation.get(&a.cluster_id).copied().unwrap_or(0.0))
        .collect();
    let base_raw: Vec<f64> = anomaly
        .iter()
        .zip(degr.iter())
        .map(|(a, d)| weights.w1 * a.anomaly_score + weights.w2 * d)
        .collect();

    let mut fallbacks = FallbackLog::new();
    let p_cluster = min_max_normalize(&base_raw);
    if p_cluster.degenerate {
        log::warn!(
            "combine: all {} base risks identical; base risk set to 0",
            base_raw.len()
        );
        fallbacks.push(Fallback::DegenerateNormalization {
            stage: STAGE.to_string(),
            population: base_raw.len(),
        });
    }

    let mut without_history = 0usize;
    let records: Vec<RiskRecord> = anomaly
        .iter()
        .zip(degr)
        .zip(p_cluster.values)
        .map(|((a, cluster_degradation), p)| {
            let sub = subcount.get(&a.meter_id).copied();
            if sub.is_none() {
                without_history += 1;
            }
            let subcount_score = sub.unwrap_or(0.0);
            let p_final = combine_probability(p, subcount_score, weights.gamma);
            RiskRecord {
                meter_id: a.meter_id.clone(),
                cluster_id: a.cluster_id,
                anomaly_score: a.anomaly_score,
                cluster_degradation,
                subcount_score,
                subcount_percent: 100.0 * subcount_score,
                has_consumption_history: sub.is_some(),
                risk_percent_base: 100.0 * p,
                risk_percent: 100.0 * p_final,
            }
        })
        .collect();

    if without_history > 0 {
        log::info!(
            "combine: {} meter(s) without consumption history scored on anomaly and degradation only",
            without_history
        );
    }

    (records, fallbacks)
}
