//! Intra-cluster anomaly scoring
//!
//! A meter is anomalous when its latent vector sits far from the centroid of
//! the cluster it was assigned to. Distances are rescaled across the whole
//! population into `anomaly_score ∈ [0, 1]`.
//!
//! Global invariants enforced:
//! - Cluster geometry is built once and never mutated afterwards
//! - A cluster whose covariance cannot be used falls back to Euclidean distance
//! - Every meter with a latent vector receives a score

use crate::error::{Fallback, FallbackLog, PipelineError, PipelineResult};
use crate::linalg::{
    euclidean, mahalanobis, mean_vector, member_matrix, regularised_cholesky, sample_covariance,
};
use crate::stats::min_max_normalize;
use crate::types::{ClusterId, LatentVector, MeterId};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Stage name used in degenerate-normalisation fallbacks
pub const STAGE: &str = "anomaly";

/// Diagonal regularisation added to every cluster covariance
pub const COVARIANCE_RIDGE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    Mahalanobis,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::Mahalanobis => "mahalanobis",
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" => Ok(DistanceMetric::Euclidean),
            "mahalanobis" => Ok(DistanceMetric::Mahalanobis),
            other => Err(format!(
                "unknown distance metric '{}' (expected euclidean or mahalanobis)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AnomalyParams {
    pub distance_metric: DistanceMetric,
}

/// Per-cluster aggregate used by every member's distance computation
#[derive(Debug, Clone)]
pub struct ClusterGeometry {
    pub centroid: DVector<f64>,
    pub members: usize,
    /// Lower Cholesky factor of the regularised covariance; `None` means Euclidean
    pub whitening: Option<DMatrix<f64>>,
}

impl ClusterGeometry {
    pub fn distance(&self, v: &[f64]) -> f64 {
        let point = DVector::from_column_slice(v);
        match &self.whitening {
            Some(lower) => {
                let diff = &point - &self.centroid;
                mahalanobis(lower, &diff).unwrap_or_else(|| diff.norm())
            }
            None => euclidean(&point, &self.centroid),
        }
    }
}

/// Anomaly result for one meter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyScore {
    pub meter_id: MeterId,
    pub cluster_id: ClusterId,
    pub distance: f64,
    pub anomaly_score: f64,
}

/// Latent dimensionality, checking every vector agrees
pub fn latent_dim(vectors: &[LatentVector]) -> PipelineResult<usize> {
    let dim = vectors.first().map(|v| v.values.len()).unwrap_or(0);
    if let Some(bad) = vectors.iter().find(|v| v.values.len() != dim) {
        return Err(PipelineError::schema(
            "latent_vectors",
            format!(
                "meter {} has {} latent values, expected {}",
                bad.meter_id,
                bad.values.len(),
                dim
            ),
        ));
    }
    Ok(dim)
}

fn cluster_of(
    meter_id: &MeterId,
    clusters: &BTreeMap<MeterId, ClusterId>,
) -> PipelineResult<ClusterId> {
    clusters.get(meter_id).copied().ok_or_else(|| {
        PipelineError::missing(
            "cluster_assignments",
            format!("no cluster assignment for meter {}", meter_id),
        )
    })
}

/// Build centroid (and, for Mahalanobis, whitening factor) per cluster
pub fn build_cluster_geometry(
    vectors: &[LatentVector],
    clusters: &BTreeMap<MeterId, ClusterId>,
    metric: DistanceMetric,
) -> PipelineResult<(BTreeMap<ClusterId, ClusterGeometry>, FallbackLog)> {
    let dim = latent_dim(vectors)?;
    let mut members: BTreeMap<ClusterId, Vec<&[f64]>> = BTreeMap::new();
    for v in vectors {
        let cluster_id = cluster_of(&v.meter_id, clusters)?;
        members.entry(cluster_id).or_default().push(&v.values);
    }

    let mut fallbacks = FallbackLog::new();
    let mut geometry = BTreeMap::new();
    for (cluster_id, rows) in members {
        let matrix = member_matrix(&rows, dim);
        let centroid = mean_vector(&matrix);
        let whitening = match metric {
            DistanceMetric::Euclidean => None,
            DistanceMetric::Mahalanobis => {
                let factor = if rows.len() < dim.max(2) {
                    None
                } else {
                    sample_covariance(&matrix, &centroid)
                        .and_then(|cov| regularised_cholesky(cov, COVARIANCE_RIDGE))
                };
                if factor.is_none() {
                    log::warn!(
                        "cluster {}: covariance of {} member(s) in {} dimensions is singular; using Euclidean distance",
                        cluster_id,
                        rows.len(),
                        dim
                    );
                    fallbacks.push(Fallback::SingularCovariance {
                        cluster_id,
                        members: rows.len(),
                    });
                }
                factor
            }
        };
        geometry.insert(
            cluster_id,
            ClusterGeometry {
                centroid,
                members: rows.len(),
                whitening,
            },
        );
    }

    Ok((geometry, fallbacks))
}

/// Distance of each meter to its own cluster's centroid, rescaled to [0, 1].
///
/// Output follows the order of `vectors`.
pub fn compute_anomaly_scores(
    vectors: &[LatentVector],
    clusters: &BTreeMap<MeterId, ClusterId>,
    metric: DistanceMetric,
) -> PipelineResult<(Vec<AnomalyScore>, FallbackLog)> {
    let (geometry, mut fallbacks) = build_cluster_geometry(vectors, clusters, metric)?;

    let mut assigned = Vec::with_capacity(vectors.len());
    for v in vectors {
        let cluster_id = cluster_of(&v.meter_id, clusters)?;
        let distance = geometry
            .get(&cluster_id)
            .map(|g| g.distance(&v.values))
            .unwrap_or(0.0);
        assigned.push((v.meter_id.clone(), cluster_id, distance));
    }

    let distances: Vec<f64> = assigned.iter().map(|(_, _, d)| *d).collect();
    let rescaled = min_max_normalize(&distances);
    if rescaled.degenerate {
        log::warn!(
            "anomaly: all {} distances identical; anomaly scores set to 0",
            distances.len()
        );
        fallbacks.push(Fallback::DegenerateNormalization {
            stage: STAGE.to_string(),
            population: distances.len(),
        });
    }

    log::info!(
        "anomaly: {} meter(s) across {} cluster(s), metric={}",
        assigned.len(),
        geometry.len(),
        metric.as_str()
    );

    let scores = assigned
        .into_iter()
        .zip(rescaled.values)
        .map(|((meter_id, cluster_id, distance), anomaly_score)| AnomalyScore {
            meter_id,
            cluster_id,
            distance,
            anomaly_score,
        })
        .collect();

    Ok((scores, fallbacks))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lv(id: &str, values: &[f64]) -> LatentVector {
        LatentVector {
            meter_id: MeterId::from(id),
            values: values.to_vec(),
        }
    }

    fn assign(pairs: &[(&str, ClusterId)]) -> BTreeMap<MeterId, ClusterId> {
        pairs.iter().map(|(m, c)| (MeterId::from(*m), *c)).collect()
    }

    #[test]
    fn test_euclidean_scores() {
        let vectors = vec![
            lv("a", &[0.0, 0.0]),
            lv("b", &[2.0, 0.0]),
            lv("c", &[10.0, 10.0]),
            lv("d", &[10.0, 14.0]),
        ];
        let clusters = assign(&[("a", 0), ("b", 0), ("c", 1), ("d", 1)]);
        let (scores, fallbacks) =
            compute_anomaly_scores(&vectors, &clusters, DistanceMetric::Euclidean).unwrap();
        // cluster 0 distances are 1, cluster 1 distances are 2
        assert_eq!(scores[0].distance, 1.0);
        assert_eq!(scores[2].distance, 2.0);
        assert_eq!(scores[0].anomaly_score, 0.0);
        assert_eq!(scores[3].anomaly_score, 1.0);
        assert!(fallbacks.is_empty());
    }

    #[test]
    fn test_outlier_scores_highest() {
        let vectors = vec![
            lv("a", &[1.0]),
            lv("b", &[1.1]),
            lv("c", &[0.9]),
            lv("d", &[5.0]),
        ];
        let clusters = assign(&[("a", 0), ("b", 0), ("c", 0), ("d", 0)]);
        let (scores, _) =
            compute_anomaly_scores(&vectors, &clusters, DistanceMetric::Euclidean).unwrap();
        let top = scores
            .iter()
            .max_by(|x, y| x.anomaly_score.total_cmp(&y.anomaly_score))
            .unwrap();
        assert_eq!(top.meter_id.as_str(), "d");
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(&s.anomaly_score)));
    }

    #[test]
    fn test_identical_points_are_degenerate() {
        let vectors = vec![lv("a", &[1.0, 1.0]), lv("b", &[1.0, 1.0])];
        let clusters = assign(&[("a", 0), ("b", 0)]);
        let (scores, fallbacks) =
            compute_anomaly_scores(&vectors, &clusters, DistanceMetric::Euclidean).unwrap();
        assert!(scores.iter().all(|s| s.anomaly_score == 0.0));
        assert!(fallbacks.has_degenerate(STAGE));
    }

    #[test]
    fn test_mahalanobis_discounts_high_variance_axis() {
        // wide spread on x, narrow on y
        let vectors = vec![
            lv("a", &[-10.0, -0.1]),
            lv("b", &[10.0, 0.1]),
            lv("c", &[-10.0, 0.1]),
            lv("d", &[10.0, -0.1]),
            lv("x", &[5.0, 0.0]),
            lv("y", &[0.0, 0.5]),
        ];
        let clusters = assign(&[("a", 0), ("b", 0), ("c", 0), ("d", 0), ("x", 0), ("y", 0)]);
        let (scores, fallbacks) =
            compute_anomaly_scores(&vectors, &clusters, DistanceMetric::Mahalanobis).unwrap();
        assert!(fallbacks.is_empty());
        let x = scores.iter().find(|s| s.meter_id.as_str() == "x").unwrap();
        let y = scores.iter().find(|s| s.meter_id.as_str() == "y").unwrap();
        assert!(y.distance > x.distance);
    }

    #[test]
    fn test_small_cluster_falls_back_to_euclidean() {
        let vectors = vec![
            lv("a", &[0.0, 0.0, 0.0]),
            lv("b", &[2.0, 0.0, 0.0]),
        ];
        let clusters = assign(&[("a", 7), ("b", 7)]);
        let (scores, fallbacks) =
            compute_anomaly_scores(&vectors, &clusters, DistanceMetric::Mahalanobis).unwrap();
        assert_eq!(fallbacks.count_singular_covariance(), 1);
        assert_eq!(scores[0].distance, 1.0);
    }

    #[test]
    fn test_missing_cluster_is_fatal() {
        let vectors = vec![lv("a", &[0.0])];
        let clusters = assign(&[]);
        let err = compute_anomaly_scores(&vectors, &clusters, DistanceMetric::Euclidean)
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingUpstreamInput { .. }));
    }

    #[test]
    fn test_ragged_vectors_are_schema_violation() {
        let vectors = vec![lv("a", &[0.0, 1.0]), lv("b", &[0.0])];
        let clusters = assign(&[("a", 0), ("b", 0)]);
        let err = compute_anomaly_scores(&vectors, &clusters, DistanceMetric::Euclidean)
            .unwrap_err();
        assert!(matches!(err, PipelineError::SchemaViolation { .. }));
    }

    #[test]
    fn test_metric_from_str() {
        assert_eq!(
            "Mahalanobis".parse::<DistanceMetric>().unwrap(),
            DistanceMetric::Mahalanobis
        );
        assert_eq!(
            "euclidean".parse::<DistanceMetric>().unwrap(),
            DistanceMetric::Euclidean
        );
        assert!("manhattan".parse::<DistanceMetric>().is_err());
    }
}
