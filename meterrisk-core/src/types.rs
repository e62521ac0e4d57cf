//! Data model shared by every pipeline stage
//!
//! Global invariants enforced:
//! - Identifiers are opaque and totally ordered (deterministic iteration)
//! - Input records are immutable once loaded
//! - Derived rows are recomputed on every run, never patched

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque meter identifier, stable across all stages
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeterId(pub String);

impl MeterId {
    pub fn new(id: impl Into<String>) -> Self {
        MeterId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MeterId {
    fn from(s: &str) -> Self {
        MeterId(s.to_string())
    }
}

/// Cluster label supplied by the upstream clustering stage
pub type ClusterId = i64;

/// One day of metered consumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    pub meter_id: MeterId,
    pub date: NaiveDate,
    pub volume: f64,
}

/// Calendar bucket a daily record is aggregated into, identified by its first day
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Period(pub NaiveDate);

impl Period {
    pub fn start(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

/// Aggregated consumption of one meter in one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodSeries {
    pub meter_id: MeterId,
    pub period: Period,
    pub aggregated_volume: f64,
}

/// Median aggregated volume of a peer group in one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMedian {
    pub period: Period,
    /// `None` for the global peer group
    pub cluster_id: Option<ClusterId>,
    pub median_volume: f64,
    pub n_peers: usize,
}

/// Peer-normalised consumption of one meter in one period
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPoint {
    pub period: Period,
    pub aggregated_volume: f64,
    pub peer_median: f64,
    pub x_norm: f64,
}

/// Upstream clustering output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub meter_id: MeterId,
    pub cluster_id: ClusterId,
}

/// Latent representation of a meter; every vector in a run has the same length
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatentVector {
    pub meter_id: MeterId,
    pub values: Vec<f64>,
}

/// Physical degradation drivers of a meter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalFeatures {
    pub meter_id: MeterId,
    pub age: f64,
    /// Accumulated-consumption degradation proxy
    pub canya: f64,
}
