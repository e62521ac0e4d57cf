//! Subcounting score
//!
//! Combines the three indicator sub-scores into a raw score (weighted sum plus
//! logical reinforcement), then rescales the raw scores across the meter
//! population into `subcount_score ∈ [0, 1]`.
//!
//! Global invariants enforced:
//! - Two passes: every raw score exists before the population bounds are taken
//! - If at least `min_signals` sub-scores exceed the threshold, raw >= floor
//! - Bounds are local to one call; nothing is cached between runs

use crate::aggregate::AggregationFrequency;
use crate::error::{Fallback, FallbackLog};
use crate::indicators::{compute_indicators, IndicatorParams, IndicatorValues};
use crate::stats::min_max_normalize;
use crate::types::{MeterId, NormalizedPoint};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stage name used in degenerate-normalisation fallbacks
pub const STAGE: &str = "subcounting";

/// Weights of the three sub-scores in the raw score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubScoreWeights {
    pub ratio: f64,
    pub trend: f64,
    pub slope_change: f64,
}

impl Default for SubScoreWeights {
    fn default() -> Self {
        SubScoreWeights {
            ratio: 0.4,
            trend: 0.3,
            slope_change: 0.3,
        }
    }
}

/// Logical reinforcement: several strong signals lift the raw score to a floor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reinforcement {
    pub threshold: f64,
    pub floor: f64,
    pub min_signals: usize,
}

impl Default for Reinforcement {
    fn default() -> Self {
        Reinforcement {
            threshold: 0.7,
            floor: 0.7,
            min_signals: 2,
        }
    }
}

/// Everything the subcounting stages need
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubcountingParams {
    pub enabled: bool,
    pub frequency: AggregationFrequency,
    pub use_cluster_peers: bool,
    pub indicators: IndicatorParams,
    pub weights: SubScoreWeights,
    pub reinforcement: Reinforcement,
}

impl Default for SubcountingParams {
    fn default() -> Self {
        SubcountingParams {
            enabled: true,
            frequency: AggregationFrequency::Monthly,
            use_cluster_peers: false,
            indicators: IndicatorParams::default(),
            weights: SubScoreWeights::default(),
            reinforcement: Reinforcement::default(),
        }
    }
}

/// Per-meter subcounting result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SubcountingMetrics {
    pub meter_id: MeterId,
    pub n_periods: usize,
    #[serde(rename = "R")]
    pub drop_ratio: f64,
    pub slope: f64,
    pub delta_s: f64,
    #[serde(rename = "s_R")]
    pub s_ratio: f64,
    #[serde(rename = "s_T")]
    pub s_trend: f64,
    pub s_delta: f64,
    pub subcount_score_raw: f64,
    pub subcount_score: f64,
    /// Fewer periods than `min_periods`; drop ratio is the neutral default
    pub low_confidence: bool,
}

/// Weighted sum of the sub-scores with logical reinforcement
pub fn combine_sub_scores(
    scores: [f64; 3],
    weights: &SubScoreWeights,
    reinforcement: &Reinforcement,
) -> f64 {
    let [s_ratio, s_trend, s_delta] = scores;
    let raw = weights.ratio * s_ratio + weights.trend * s_trend + weights.slope_change * s_delta;

    let strong = scores
        .iter()
        .filter(|s| **s > reinforcement.threshold)
        .count();
    if strong >= reinforcement.min_signals {
        raw.max(reinforcement.floor)
    } else {
        raw
    }
}

/// Compute subcounting metrics for every meter with at least one normalised period.
///
/// Output is ordered by meter id.
pub fn compute_subcounting_metrics(
    normalized: &BTreeMap<MeterId, Vec<NormalizedPoint>>,
    params: &SubcountingParams,
) -> (Vec<SubcountingMetrics>, FallbackLog) {
    let mut fallbacks = FallbackLog::new();
    let entries: Vec<(&MeterId, &Vec<NormalizedPoint>)> = normalized
        .iter()
        .filter(|(_, points)| !points.is_empty())
        .collect();

    // Pass 1: per-meter indicators and raw scores
    let raw: Vec<(MeterId, IndicatorValues, f64)> = entries
        .par_iter()
        .map(|(meter_id, points)| {
            let x: Vec<f64> = points.iter().map(|p| p.x_norm).collect();
            let values = compute_indicators(&x, &params.indicators);
            let raw_score =
                combine_sub_scores(values.sub_scores(), &params.weights, &params.reinforcement);
            ((*meter_id).clone(), values, raw_score)
        })
        .collect();

    // Pass 2: population rescale
    let raw_scores: Vec<f64> = raw.iter().map(|(_, _, r)| *r).collect();
    let rescaled = min_max_normalize(&raw_scores);
    if rescaled.degenerate {
        log::warn!(
            "subcounting: all {} raw scores identical ({:.4}); scores set to 0",
            raw_scores.len(),
            rescaled.min
        );
        fallbacks.push(Fallback::DegenerateNormalization {
            stage: STAGE.to_string(),
            population: raw_scores.len(),
        });
    }

    let mut short = 0usize;
    let metrics: Vec<SubcountingMetrics> = raw
        .into_iter()
        .zip(rescaled.values)
        .map(|((meter_id, v, raw_score), score)| {
            if !v.sufficient_history {
                short += 1;
                fallbacks.push(Fallback::InsufficientData {
                    meter_id: meter_id.clone(),
                    n_periods: v.n_periods,
                });
            }
            SubcountingMetrics {
                meter_id,
                n_periods: v.n_periods,
                drop_ratio: v.drop_ratio,
                slope: v.slope,
                delta_s: v.delta_s,
                s_ratio: v.s_ratio,
                s_trend: v.s_trend,
                s_delta: v.s_delta,
                subcount_score_raw: raw_score,
                subcount_score: score,
                low_confidence: !v.sufficient_history,
            }
        })
        .collect();

    if short > 0 {
        log::warn!(
            "subcounting: {} meter(s) with fewer than {} periods use a neutral drop ratio",
            short,
            params.indicators.min_periods
        );
    }
    log::info!("subcounting: scored {} meter(s)", metrics.len());

    (metrics, fallbacks)
}
