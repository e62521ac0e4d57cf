//! Error taxonomy
//!
//! Fatal conditions abort the run before any output exists and surface as
//! `PipelineError`. Per-meter and per-cluster problems are absorbed with a
//! neutral default and recorded as a `Fallback` instead.

use crate::types::{ClusterId, MeterId};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("missing upstream input '{table}': {detail}")]
    MissingUpstreamInput { table: String, detail: String },

    #[error("schema violation in '{table}': {detail}")]
    SchemaViolation { table: String, detail: String },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn missing(table: &str, detail: impl Into<String>) -> Self {
        PipelineError::MissingUpstreamInput {
            table: table.to_string(),
            detail: detail.into(),
        }
    }

    pub fn schema(table: &str, detail: impl Into<String>) -> Self {
        PipelineError::SchemaViolation {
            table: table.to_string(),
            detail: detail.into(),
        }
    }
}

/// A locally absorbed anomaly and the neutral default that replaced it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fallback {
    /// Too few periods for a stable drop ratio; R defaulted to 1.0
    InsufficientData { meter_id: MeterId, n_periods: usize },
    /// All raw values of a population were identical; every score set to 0
    DegenerateNormalization { stage: String, population: usize },
    /// Covariance could not be inverted; Euclidean distance used for the cluster
    SingularCovariance { cluster_id: ClusterId, members: usize },
    /// No peer group for the meter's periods; those periods were not normalised
    MissingPeers { meter_id: MeterId, periods: usize },
}

/// Fallbacks collected during one run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FallbackLog {
    pub entries: Vec<Fallback>,
}

impl FallbackLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fallback: Fallback) {
        self.entries.push(fallback);
    }

    pub fn extend(&mut self, other: FallbackLog) {
        self.entries.extend(other.entries);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count_insufficient_data(&self) -> usize {
        self.entries
            .iter()
            .filter(|f| matches!(f, Fallback::InsufficientData { .. }))
            .count()
    }

    pub fn count_singular_covariance(&self) -> usize {
        self.entries
            .iter()
            .filter(|f| matches!(f, Fallback::SingularCovariance { .. }))
            .count()
    }

    pub fn has_degenerate(&self, stage: &str) -> bool {
        self.entries.iter().any(
            |f| matches!(f, Fallback::DegenerateNormalization { stage: s, .. } if s == stage),
        )
    }
}
