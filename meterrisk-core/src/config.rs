//! Configuration file support for meterrisk
//!
//! Loads run parameters from JSON files.
//!
//! Search order:
//! 1. Explicit path (--config CLI flag)
//! 2. `.meterriskrc.json` in the working directory
//! 3. `meterrisk.config.json` in the working directory
//!
//! All fields are optional. CLI flags take precedence over config file values.

use crate::aggregate::AggregationFrequency;
use crate::anomaly::{AnomalyParams, DistanceMetric};
use crate::combine::CombinationWeights;
use crate::degradation::{DegradationNormalization, DegradationParams};
use crate::indicators::RampThresholds;
use crate::risk::StatusThresholds;
use crate::subcount::SubcountingParams;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Upper bound for any blend weight
const MAX_WEIGHT: f64 = 10.0;

/// meterrisk configuration loaded from a JSON config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeterRiskConfig {
    /// Consumption aggregation and subcounting indicators
    #[serde(default)]
    pub subcounting: Option<SubcountingConfig>,

    /// Intra-cluster anomaly scoring
    #[serde(default)]
    pub anomaly: Option<AnomalyConfig>,

    /// Cluster degradation weights
    #[serde(default)]
    pub degradation: Option<DegradationConfig>,

    /// Base-risk blend and subcounting cap
    #[serde(default)]
    pub combination: Option<CombinationConfig>,

    /// Status thresholds in percent
    #[serde(default)]
    pub status_thresholds: Option<StatusThresholdConfig>,

    /// Maximum number of results to show
    #[serde(default)]
    pub top: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubcountingConfig {
    /// Run the subcounting stages (default: true)
    pub enabled: Option<bool>,
    /// Aggregation period (default: monthly)
    pub frequency: Option<AggregationFrequency>,
    /// Periods required for a drop ratio (default: 12)
    pub min_periods: Option<usize>,
    /// Baseline window length (default: 12)
    pub baseline_window: Option<usize>,
    /// Recent window length (default: 6)
    pub recent_window: Option<usize>,
    /// Periods required for trend and slope change (default: 6)
    pub min_trend_periods: Option<usize>,
    /// Use cluster peers instead of the global population (default: false)
    pub use_cluster_peers: Option<bool>,
    pub weights: Option<SubScoreWeightConfig>,
    pub reinforcement: Option<ReinforcementConfig>,
    pub ratio_thresholds: Option<RampConfig>,
    pub trend_thresholds: Option<RampConfig>,
    pub slope_change_thresholds: Option<RampConfig>,
}

/// Sub-score weights
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubScoreWeightConfig {
    /// Weight for the drop ratio (default: 0.4)
    pub ratio: Option<f64>,
    /// Weight for the trend slope (default: 0.3)
    pub trend: Option<f64>,
    /// Weight for the slope change (default: 0.3)
    pub slope_change: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReinforcementConfig {
    /// Sub-score a signal must exceed to count as strong (default: 0.7)
    pub threshold: Option<f64>,
    /// Raw score floor once enough signals are strong (default: 0.7)
    pub floor: Option<f64>,
    /// Strong signals needed (default: 2)
    pub min_signals: Option<usize>,
}

/// Ramp endpoints: the sub-score is 1 at or below `full`, 0 at or above `none`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RampConfig {
    pub full: Option<f64>,
    pub none: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnomalyConfig {
    /// euclidean or mahalanobis (default: euclidean)
    pub distance_metric: Option<DistanceMetric>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DegradationConfig {
    /// Weight for age (default: 0.6)
    pub alpha: Option<f64>,
    /// Weight for canya (default: 0.4)
    pub beta: Option<f64>,
    /// per_meter or cluster_mean (default: per_meter)
    pub normalization: Option<DegradationNormalization>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CombinationConfig {
    /// Weight for anomaly_score (default: 0.5)
    pub w1: Option<f64>,
    /// Weight for cluster_degradation (default: 0.5)
    pub w2: Option<f64>,
    /// Subcounting cap in [0, 1] (default: 0.8)
    pub gamma: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusThresholdConfig {
    /// Warning at or above this percent (default: 50)
    pub warning: Option<f64>,
    /// Alert at or above this percent (default: 80)
    pub alert: Option<f64>,
}

/// Resolved configuration, built once and passed by reference to every stage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedConfig {
    pub subcounting: SubcountingParams,
    pub anomaly: AnomalyParams,
    pub degradation: DegradationParams,
    pub combination: CombinationWeights,
    pub status: StatusThresholds,
    pub top_n: Option<usize>,
    /// Path the config was loaded from (None if defaults)
    pub config_path: Option<PathBuf>,
}

fn ramp(config: &Option<RampConfig>, default: RampThresholds) -> RampThresholds {
    match config {
        Some(r) => RampThresholds {
            full: r.full.unwrap_or(default.full),
            none: r.none.unwrap_or(default.none),
        },
        None => default,
    }
}

impl MeterRiskConfig {
    /// Validate the configuration for logical errors
    pub fn validate(&self) -> Result<()> {
        self.merge().validate()
    }

    /// Resolve config into the typed parameter set used by the pipeline
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        self.validate()?;
        Ok(self.merge())
    }

    /// Overlay file values on the defaults without validating
    fn merge(&self) -> ResolvedConfig {
        let mut resolved = ResolvedConfig::default();

        if let Some(ref s) = self.subcounting {
            let p = &mut resolved.subcounting;
            p.enabled = s.enabled.unwrap_or(p.enabled);
            p.frequency = s.frequency.unwrap_or(p.frequency);
            p.use_cluster_peers = s.use_cluster_peers.unwrap_or(p.use_cluster_peers);

            let ind = &mut p.indicators;
            ind.min_periods = s.min_periods.unwrap_or(ind.min_periods);
            ind.baseline_window = s.baseline_window.unwrap_or(ind.baseline_window);
            ind.recent_window = s.recent_window.unwrap_or(ind.recent_window);
            ind.min_trend_periods = s.min_trend_periods.unwrap_or(ind.min_trend_periods);
            ind.ratio = ramp(&s.ratio_thresholds, ind.ratio);
            ind.trend = ramp(&s.trend_thresholds, ind.trend);
            ind.slope_change = ramp(&s.slope_change_thresholds, ind.slope_change);

            if let Some(ref w) = s.weights {
                p.weights.ratio = w.ratio.unwrap_or(p.weights.ratio);
                p.weights.trend = w.trend.unwrap_or(p.weights.trend);
                p.weights.slope_change = w.slope_change.unwrap_or(p.weights.slope_change);
            }
            if let Some(ref r) = s.reinforcement {
                let rf = &mut p.reinforcement;
                rf.threshold = r.threshold.unwrap_or(rf.threshold);
                rf.floor = r.floor.unwrap_or(rf.floor);
                rf.min_signals = r.min_signals.unwrap_or(rf.min_signals);
            }
        }

        if let Some(ref a) = self.anomaly {
            if let Some(metric) = a.distance_metric {
                resolved.anomaly.distance_metric = metric;
            }
        }

        if let Some(ref d) = self.degradation {
            let p = &mut resolved.degradation;
            p.alpha = d.alpha.unwrap_or(p.alpha);
            p.beta = d.beta.unwrap_or(p.beta);
            p.normalization = d.normalization.unwrap_or(p.normalization);
        }

        if let Some(ref c) = self.combination {
            let p = &mut resolved.combination;
            p.w1 = c.w1.unwrap_or(p.w1);
            p.w2 = c.w2.unwrap_or(p.w2);
            p.gamma = c.gamma.unwrap_or(p.gamma);
        }

        if let Some(ref t) = self.status_thresholds {
            resolved.status.warning = t.warning.unwrap_or(resolved.status.warning);
            resolved.status.alert = t.alert.unwrap_or(resolved.status.alert);
        }

        resolved.top_n = self.top;
        resolved
    }
}

fn check_weight(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        anyhow::bail!("{} must be non-negative (got {})", name, value);
    }
    if value > MAX_WEIGHT {
        anyhow::bail!("{} must be at most {} (got {})", name, MAX_WEIGHT, value);
    }
    Ok(())
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        anyhow::bail!("{} must be within [0, 1] (got {})", name, value);
    }
    Ok(())
}

fn check_ramp(name: &str, ramp: &RampThresholds) -> Result<()> {
    if !ramp.full.is_finite() || !ramp.none.is_finite() {
        anyhow::bail!("{} endpoints must be finite", name);
    }
    if ramp.full >= ramp.none {
        anyhow::bail!(
            "{}.full ({}) must be less than {}.none ({})",
            name,
            ramp.full,
            name,
            ramp.none
        );
    }
    Ok(())
}

impl ResolvedConfig {
    /// Validate the effective parameters (also re-run after CLI overrides)
    pub fn validate(&self) -> Result<()> {
        let s = &self.subcounting;
        let ind = &s.indicators;
        for (name, val) in [
            ("subcounting.min_periods", ind.min_periods),
            ("subcounting.baseline_window", ind.baseline_window),
            ("subcounting.recent_window", ind.recent_window),
            ("subcounting.min_trend_periods", ind.min_trend_periods),
        ] {
            if val == 0 {
                anyhow::bail!("{} must be at least 1", name);
            }
        }
        check_ramp("subcounting.ratio_thresholds", &ind.ratio)?;
        check_ramp("subcounting.trend_thresholds", &ind.trend)?;
        check_ramp("subcounting.slope_change_thresholds", &ind.slope_change)?;

        for (name, val) in [
            ("subcounting.weights.ratio", s.weights.ratio),
            ("subcounting.weights.trend", s.weights.trend),
            ("subcounting.weights.slope_change", s.weights.slope_change),
            ("degradation.alpha", self.degradation.alpha),
            ("degradation.beta", self.degradation.beta),
            ("combination.w1", self.combination.w1),
            ("combination.w2", self.combination.w2),
        ] {
            check_weight(name, val)?;
        }

        check_unit("subcounting.reinforcement.threshold", s.reinforcement.threshold)?;
        check_unit("subcounting.reinforcement.floor", s.reinforcement.floor)?;
        // Three sub-scores can be strong at most
        if !(1..=3).contains(&s.reinforcement.min_signals) {
            anyhow::bail!(
                "subcounting.reinforcement.min_signals must be within 1..=3 (got {})",
                s.reinforcement.min_signals
            );
        }
        check_unit("combination.gamma", self.combination.gamma)?;

        let (warning, alert) = (self.status.warning, self.status.alert);
        for (name, val) in [
            ("status_thresholds.warning", warning),
            ("status_thresholds.alert", alert),
        ] {
            if !(val > 0.0 && val <= 100.0) {
                anyhow::bail!("{} must be within (0, 100] (got {})", name, val);
            }
        }
        if warning >= alert {
            anyhow::bail!(
                "status_thresholds.warning ({}) must be less than status_thresholds.alert ({})",
                warning,
                alert
            );
        }

        if self.top_n == Some(0) {
            anyhow::bail!("top must be at least 1");
        }

        Ok(())
    }

    /// Build a ResolvedConfig with all defaults (no config file)
    pub fn defaults() -> Result<Self> {
        MeterRiskConfig::default().resolve()
    }
}

/// Discover and load a config file from the working directory
///
/// Search order:
/// 1. `.meterriskrc.json`
/// 2. `meterrisk.config.json`
///
/// Returns `None` if no config file is found (use defaults).
pub fn discover_config(root: &Path) -> Result<Option<(MeterRiskConfig, PathBuf)>> {
    for name in [".meterriskrc.json", "meterrisk.config.json"] {
        let path = root.join(name);
        if path.exists() {
            let config = load_config_file(&path)?;
            return Ok(Some((config, path)));
        }
    }
    Ok(None)
}

/// Load config from an explicit file path
pub fn load_config_file(path: &Path) -> Result<MeterRiskConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let config: MeterRiskConfig = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    config
        .validate()
        .with_context(|| format!("invalid config in: {}", path.display()))?;

    Ok(config)
}

/// Load and resolve config
///
/// If `config_path` is provided, loads from that file.
/// Otherwise, discovers config in `root`.
/// Returns default config if nothing is found.
pub fn load_and_resolve(root: &Path, config_path: Option<&Path>) -> Result<ResolvedConfig> {
    let (config, source_path) = if let Some(path) = config_path {
        let config = load_config_file(path)?;
        (config, Some(path.to_path_buf()))
    } else {
        match discover_config(root)? {
            Some((config, path)) => (config, Some(path)),
            None => (MeterRiskConfig::default(), None),
        }
    };

    let mut resolved = config.resolve()?;
    resolved.config_path = source_path;
    Ok(resolved)
}
