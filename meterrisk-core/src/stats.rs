//! Small numeric helpers shared by the scorers
//!
//! Global invariants enforced:
//! - Pure functions of their inputs (no hidden state, bounds are returned, not stored)
//! - Empty input never panics

use std::cmp::Ordering;

/// Slopes smaller than this in magnitude are treated as exactly flat
pub const FLAT_SLOPE_EPSILON: f64 = 1e-9;

/// Result of a population-wide min-max rescale
#[derive(Debug, Clone, PartialEq)]
pub struct Rescaled {
    pub values: Vec<f64>,
    pub min: f64,
    pub max: f64,
    /// True when every input value was identical (all outputs are 0)
    pub degenerate: bool,
}

/// Rescale values to [0, 1] using the population min and max.
///
/// Two passes: bounds first, then the rescale. When `max == min` every
/// output is 0 and `degenerate` is set.
pub fn min_max_normalize(values: &[f64]) -> Rescaled {
    if values.is_empty() {
        return Rescaled {
            values: Vec::new(),
            min: 0.0,
            max: 0.0,
            degenerate: false,
        };
    }

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    if max > min {
        let span = max - min;
        Rescaled {
            values: values
                .iter()
                .map(|v| ((v - min) / span).clamp(0.0, 1.0))
                .collect(),
            min,
            max,
            degenerate: false,
        }
    } else {
        Rescaled {
            values: vec![0.0; values.len()],
            min,
            max,
            degenerate: true,
        }
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Median (average of the two middle values for even lengths)
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Sample standard deviation (n - 1 denominator); 0 for fewer than two values
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = values.iter().sum::<f64>() / values.len() as f64;
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    (ss / (values.len() - 1) as f64).sqrt()
}

/// Ordinary least-squares slope of `y` against `t = 0..n-1`.
///
/// Returns 0 for fewer than 3 points; near-zero slopes snap to exactly 0.
pub fn ols_slope(y: &[f64]) -> f64 {
    let n = y.len();
    if n < 3 {
        return 0.0;
    }
    let t_mean = (n - 1) as f64 / 2.0;
    let y_mean = y.iter().sum::<f64>() / n as f64;

    let mut num = 0.0;
    let mut denom = 0.0;
    for (i, v) in y.iter().enumerate() {
        let dt = i as f64 - t_mean;
        num += dt * (v - y_mean);
        denom += dt * dt;
    }
    if denom <= 0.0 {
        return 0.0;
    }

    let slope = num / denom;
    if slope.abs() < FLAT_SLOPE_EPSILON {
        0.0
    } else {
        slope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_max_basic() {
        let r = min_max_normalize(&[2.0, 4.0, 6.0]);
        assert_eq!(r.values, vec![0.0, 0.5, 1.0]);
        assert_eq!(r.min, 2.0);
        assert_eq!(r.max, 6.0);
        assert!(!r.degenerate);
    }

    #[test]
    fn test_min_max_degenerate() {
        let r = min_max_normalize(&[3.0, 3.0, 3.0]);
        assert_eq!(r.values, vec![0.0, 0.0, 0.0]);
        assert!(r.degenerate);
    }

    #[test]
    fn test_min_max_empty() {
        let r = min_max_normalize(&[]);
        assert!(r.values.is_empty());
        assert!(!r.degenerate);
    }

    #[test]
    fn test_min_max_idempotent_on_unit_population() {
        let once = min_max_normalize(&[0.0, 0.25, 0.8, 1.0]);
        let twice = min_max_normalize(&once.values);
        assert_eq!(once.values, twice.values);
    }

    #[test]
    fn test_median_odd_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_sample_std() {
        assert_eq!(sample_std(&[5.0]), 0.0);
        let s = sample_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((s - 2.138_089_935).abs() < 1e-6);
    }

    #[test]
    fn test_ols_slope_linear() {
        let y: Vec<f64> = (0..10).map(|i| 3.0 - 0.5 * i as f64).collect();
        assert!((ols_slope(&y) + 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_ols_slope_short_and_flat() {
        assert_eq!(ols_slope(&[1.0, 2.0]), 0.0);
        assert_eq!(ols_slope(&[0.3; 12]), 0.0);
    }
}
