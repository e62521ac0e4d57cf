//! Cluster-level physical degradation
//!
//! `D_k = α·norm(age_k) + β·norm(canya_k)` per cluster, then rescaled across
//! clusters to [0, 1] and broadcast to every member.
//!
//! Global invariants enforced:
//! - One value per cluster; every member of a cluster sees the same value
//! - The normalisation level is chosen by configuration and applied uniformly

use crate::error::{Fallback, FallbackLog, PipelineError, PipelineResult};
use crate::stats::{mean, min_max_normalize};
use crate::types::{ClusterId, MeterId, PhysicalFeatures};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Stage name used in degenerate-normalisation fallbacks
pub const STAGE: &str = "degradation";

/// Where age and canya are min-max normalised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationNormalization {
    /// Normalise each meter across the population, then average per cluster
    #[default]
    PerMeter,
    /// Average raw values per cluster, then normalise across clusters
    ClusterMean,
}

impl DegradationNormalization {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationNormalization::PerMeter => "per_meter",
            DegradationNormalization::ClusterMean => "cluster_mean",
        }
    }
}

impl FromStr for DegradationNormalization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per_meter" | "per-meter" => Ok(DegradationNormalization::PerMeter),
            "cluster_mean" | "cluster-mean" => Ok(DegradationNormalization::ClusterMean),
            other => Err(format!(
                "unknown degradation normalization '{}' (expected per_meter or cluster_mean)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DegradationParams {
    /// Weight of age
    pub alpha: f64,
    /// Weight of the accumulated-consumption proxy
    pub beta: f64,
    pub normalization: DegradationNormalization,
}

impl Default for DegradationParams {
    fn default() -> Self {
        DegradationParams {
            alpha: 0.6,
            beta: 0.4,
            normalization: DegradationNormalization::PerMeter,
        }
    }
}

/// Degradation of one cluster
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterDegradation {
    pub cluster_id: ClusterId,
    pub members: usize,
    pub mean_age: f64,
    pub mean_canya: f64,
    pub raw: f64,
    pub degradation: f64,
}

/// Compute `cluster_degradation` for every cluster that has members in `features`
pub fn compute_cluster_degradation(
    features: &[PhysicalFeatures],
    clusters: &BTreeMap<MeterId, ClusterId>,
    params: &DegradationParams,
) -> PipelineResult<(BTreeMap<ClusterId, ClusterDegradation>, FallbackLog)> {
    let mut labels = Vec::with_capacity(features.len());
    for f in features {
        let cluster_id = clusters.get(&f.meter_id).copied().ok_or_else(|| {
            PipelineError::missing(
                "cluster_assignments",
                format!("no cluster assignment for meter {}", f.meter_id),
            )
        })?;
        labels.push(cluster_id);
    }

    let ages: Vec<f64> = features.iter().map(|f| f.age).collect();
    let canyas: Vec<f64> = features.iter().map(|f| f.canya).collect();
    let (ages, canyas) = match params.normalization {
        DegradationNormalization::PerMeter => (
            min_max_normalize(&ages).values,
            min_max_normalize(&canyas).values,
        ),
        DegradationNormalization::ClusterMean => (ages, canyas),
    };

    let mut grouped: BTreeMap<ClusterId, (Vec<f64>, Vec<f64>)> = BTreeMap::new();
    for ((cluster_id, age), canya) in labels.iter().zip(ages).zip(canyas) {
        let entry = grouped.entry(*cluster_id).or_default();
        entry.0.push(age);
        entry.1.push(canya);
    }

    let cluster_ids: Vec<ClusterId> = grouped.keys().copied().collect();
    let members: Vec<usize> = grouped.values().map(|(a, _)| a.len()).collect();
    let mut mean_ages: Vec<f64> = grouped
        .values()
        .map(|(a, _)| mean(a).unwrap_or(0.0))
        .collect();
    let mut mean_canyas: Vec<f64> = grouped
        .values()
        .map(|(_, c)| mean(c).unwrap_or(0.0))
        .collect();

    if params.normalization == DegradationNormalization::ClusterMean {
        mean_ages = min_max_normalize(&mean_ages).values;
        mean_canyas = min_max_normalize(&mean_canyas).values;
    }

    let raw: Vec<f64> = mean_ages
        .iter()
        .zip(mean_canyas.iter())
        .map(|(a, c)| params.alpha * a + params.beta * c)
        .collect();

    let mut fallbacks = FallbackLog::new();
    let rescaled = min_max_normalize(&raw);
    if rescaled.degenerate {
        log::warn!(
            "degradation: all {} cluster indices identical; degradation set to 0",
            raw.len()
        );
        fallbacks.push(Fallback::DegenerateNormalization {
            stage: STAGE.to_string(),
            population: raw.len(),
        });
    }

    let mut result = BTreeMap::new();
    for (i, cluster_id) in cluster_ids.into_iter().enumerate() {
        result.insert(
            cluster_id,
            ClusterDegradation {
                cluster_id,
                members: members[i],
                mean_age: mean_ages[i],
                mean_canya: mean_canyas[i],
                raw: raw[i],
                degradation: rescaled.values[i],
            },
        );
    }

    log::info!(
        "degradation: {} cluster(s), normalization={}",
        result.len(),
        params.normalization.as_str()
    );

    Ok((result, fallbacks))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pf(id: &str, age: f64, canya: f64) -> PhysicalFeatures {
        PhysicalFeatures {
            meter_id: MeterId::from(id),
            age,
            canya,
        }
    }

    fn assign(pairs: &[(&str, ClusterId)]) -> BTreeMap<MeterId, ClusterId> {
        pairs.iter().map(|(m, c)| (MeterId::from(*m), *c)).collect()
    }

    #[test]
    fn test_per_meter_normalization() {
        let features = vec![
            pf("a", 0.0, 0.0),
            pf("b", 10.0, 100.0),
            pf("c", 20.0, 200.0),
            pf("d", 20.0, 0.0),
        ];
        let clusters = assign(&[("a", 0), ("b", 0), ("c", 1), ("d", 1)]);
        let (result, fallbacks) =
            compute_cluster_degradation(&features, &clusters, &DegradationParams::default())
                .unwrap();
        // cluster 0: age (0, .5) → .25, canya (0, .5) → .25 → D = .25
        // cluster 1: age (1, 1) → 1, canya (1, 0) → .5 → D = .8
        assert!((result[&0].raw - 0.25).abs() < 1e-12);
        assert!((result[&1].raw - 0.8).abs() < 1e-12);
        assert_eq!(result[&0].degradation, 0.0);
        assert_eq!(result[&1].degradation, 1.0);
        assert!(fallbacks.is_empty());
    }

    #[test]
    fn test_cluster_mean_normalization() {
        let features = vec![
            pf("a", 2.0, 10.0),
            pf("b", 4.0, 30.0),
            pf("c", 10.0, 20.0),
            pf("d", 6.0, 30.0),
            pf("e", 8.0, 50.0),
        ];
        let clusters = assign(&[("a", 0), ("b", 0), ("c", 1), ("d", 2), ("e", 2)]);
        let params = DegradationParams {
            normalization: DegradationNormalization::ClusterMean,
            ..Default::default()
        };
        let (result, _) = compute_cluster_degradation(&features, &clusters, &params).unwrap();
        // cluster means: age (3, 10, 7) → (0, 1, 4/7); canya (20, 20, 40) → (0, 0, 1)
        assert!((result[&0].raw - 0.0).abs() < 1e-12);
        assert!((result[&1].raw - 0.6).abs() < 1e-12);
        assert!((result[&2].raw - (0.6 * 4.0 / 7.0 + 0.4)).abs() < 1e-12);
        assert_eq!(result[&2].degradation, 1.0);
        assert_eq!(result[&0].degradation, 0.0);
    }

    #[test]
    fn test_single_cluster_is_degenerate() {
        let features = vec![pf("a", 1.0, 1.0), pf("b", 5.0, 9.0)];
        let clusters = assign(&[("a", 3), ("b", 3)]);
        let (result, fallbacks) =
            compute_cluster_degradation(&features, &clusters, &DegradationParams::default())
                .unwrap();
        assert_eq!(result[&3].degradation, 0.0);
        assert!(fallbacks.has_degenerate(STAGE));
    }

    #[test]
    fn test_missing_assignment_is_fatal() {
        let features = vec![pf("a", 1.0, 1.0)];
        let err = compute_cluster_degradation(&features, &assign(&[]), &Default::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingUpstreamInput { .. }));
    }

    #[test]
    fn test_normalization_from_str() {
        assert_eq!(
            "cluster-mean".parse::<DegradationNormalization>().unwrap(),
            DegradationNormalization::ClusterMean
        );
        assert_eq!(
            "per_meter".parse::<DegradationNormalization>().unwrap(),
            DegradationNormalization::PerMeter
        );
        assert!("global".parse::<DegradationNormalization>().is_err());
    }
}
