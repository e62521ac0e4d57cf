//! Subcounting (under-registration) indicators
//!
//! Three independent signals computed on a meter's peer-normalised series,
//! each mapped to a bounded sub-score in [0, 1]:
//!
//! - Drop ratio `R = mean(recent) / mean(baseline)`
//! - Relative trend slope `β1 / median(x_norm)`
//! - Slope change `s_second / s_first` between the two halves of the series
//!
//! Global invariants enforced:
//! - Insufficient history yields the neutral value, never an error
//! - Every mapping is monotone non-increasing in its ratio
//! - Thresholds come from `IndicatorParams`, never from literals at call sites

use crate::stats::{median, ols_slope};
use serde::Serialize;

/// Neutral drop ratio / slope change (no degradation assumed)
pub const NEUTRAL_RATIO: f64 = 1.0;

/// First-half slopes below this magnitude make the slope change neutral
pub const SLOPE_CHANGE_EPSILON: f64 = 1e-6;

/// Piecewise-linear ramp: 1 at or below `full`, 0 at or above `none`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampThresholds {
    pub full: f64,
    pub none: f64,
}

impl RampThresholds {
    pub fn score(&self, value: f64) -> f64 {
        ramp_score(value, self.full, self.none)
    }
}

/// Map `value` to [0, 1]: `<= full → 1`, `>= none → 0`, linear in between.
///
/// Requires `full < none`; non-finite values score 0.
pub fn ramp_score(value: f64, full: f64, none: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    if value <= full {
        1.0
    } else if value >= none {
        0.0
    } else {
        (none - value) / (none - full)
    }
}

/// Windows and thresholds for the indicator set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorParams {
    /// Periods required before the drop ratio is trusted
    pub min_periods: usize,
    pub baseline_window: usize,
    pub recent_window: usize,
    /// Periods required for the trend sub-score and slope change
    pub min_trend_periods: usize,
    pub ratio: RampThresholds,
    pub trend: RampThresholds,
    pub slope_change: RampThresholds,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        IndicatorParams {
            min_periods: 12,
            baseline_window: 12,
            recent_window: 6,
            min_trend_periods: 6,
            ratio: RampThresholds {
                full: 0.5,
                none: 0.8,
            },
            trend: RampThresholds {
                full: -0.05,
                none: 0.0,
            },
            slope_change: RampThresholds {
                full: 0.5,
                none: 0.8,
            },
        }
    }
}

/// Raw indicators and their sub-scores for one meter
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IndicatorValues {
    pub n_periods: usize,
    pub drop_ratio: f64,
    pub slope: f64,
    pub rel_slope: f64,
    pub delta_s: f64,
    pub s_ratio: f64,
    pub s_trend: f64,
    pub s_delta: f64,
    /// False when the drop ratio fell back to neutral for lack of history
    pub sufficient_history: bool,
}

impl IndicatorValues {
    pub fn sub_scores(&self) -> [f64; 3] {
        [self.s_ratio, self.s_trend, self.s_delta]
    }
}

/// True when the series is long enough for a drop ratio
pub fn has_sufficient_history(n: usize, params: &IndicatorParams) -> bool {
    n >= params.min_periods && n > params.recent_window
}

/// Long-term drop ratio of the recent window against the preceding baseline
pub fn drop_ratio(x: &[f64], params: &IndicatorParams) -> f64 {
    let n = x.len();
    if !has_sufficient_history(n, params) {
        return NEUTRAL_RATIO;
    }

    let recent_start = n - params.recent_window;
    let baseline_start = recent_start.saturating_sub(params.baseline_window);
    let recent = &x[recent_start..];
    let baseline = &x[baseline_start..recent_start];
    if baseline.is_empty() {
        return NEUTRAL_RATIO;
    }

    let mean_recent = recent.iter().sum::<f64>() / recent.len() as f64;
    let mean_baseline = baseline.iter().sum::<f64>() / baseline.len() as f64;
    if mean_baseline <= 0.0 {
        return NEUTRAL_RATIO;
    }

    mean_recent / mean_baseline
}

/// Trend slope and the slope relative to the series' median level.
///
/// The relative slope is 0 when the series is shorter than
/// `min_trend_periods` or its median level is not positive.
pub fn trend_slope(x: &[f64], params: &IndicatorParams) -> (f64, f64) {
    let slope = ols_slope(x);
    if x.len() < params.min_trend_periods {
        return (slope, 0.0);
    }
    match median(x) {
        Some(level) if level > 0.0 => (slope, slope / level),
        _ => (slope, 0.0),
    }
}

/// Ratio of second-half to first-half slope (floor split for odd lengths)
pub fn slope_change(x: &[f64], params: &IndicatorParams) -> f64 {
    let n = x.len();
    if n < params.min_trend_periods {
        return NEUTRAL_RATIO;
    }
    let mid = n / 2;
    let s_first = ols_slope(&x[..mid]);
    let s_second = ols_slope(&x[mid..]);
    if s_first.abs() < SLOPE_CHANGE_EPSILON {
        return NEUTRAL_RATIO;
    }
    s_second / s_first
}

/// Compute all three indicators and their sub-scores for one series
pub fn compute_indicators(x: &[f64], params: &IndicatorParams) -> IndicatorValues {
    let n = x.len();
    let ratio = drop_ratio(x, params);
    let (slope, rel_slope) = trend_slope(x, params);
    let delta_s = slope_change(x, params);

    let s_trend = if n < params.min_trend_periods {
        0.0
    } else {
        params.trend.score(rel_slope)
    };

    IndicatorValues {
        n_periods: n,
        drop_ratio: ratio,
        slope,
        rel_slope,
        delta_s,
        s_ratio: params.ratio.score(ratio),
        s_trend,
        s_delta: params.slope_change.score(delta_s),
        sufficient_history: has_sufficient_history(n, params),
    }
}
