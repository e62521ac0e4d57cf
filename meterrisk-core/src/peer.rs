//! Peer normalisation of period series
//!
//! Each meter is judged only against contemporaries: its period volume is
//! divided by the median volume of its peer group in the same period, which
//! cancels seasonality and city-wide shifts.
//!
//! Global invariants enforced:
//! - Peer medians are computed once per run, after every series is known
//! - `x_norm >= 0`
//! - A period with no peer group emits no normalised row

use crate::aggregate::group_by_meter;
use crate::error::{Fallback, FallbackLog};
use crate::stats::median;
use crate::types::{ClusterId, MeterId, NormalizedPoint, PeerMedian, Period, PeriodSeries};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Added to the peer median to keep the division finite
pub const PEER_EPSILON: f64 = 1e-6;

/// Peer group key: `None` is the global group
type PeerKey = (Option<ClusterId>, Period);

/// Output of the normaliser
#[derive(Debug, Clone, Default)]
pub struct NormalizedSet {
    pub series: BTreeMap<MeterId, Vec<NormalizedPoint>>,
    pub peer_medians: Vec<PeerMedian>,
    pub fallbacks: FallbackLog,
}

fn peer_group(
    meter_id: &MeterId,
    clusters: Option<&BTreeMap<MeterId, ClusterId>>,
) -> Option<Option<ClusterId>> {
    match clusters {
        None => Some(None),
        Some(map) => map.get(meter_id).map(|c| Some(*c)),
    }
}

/// Median aggregated volume per (peer group, period).
///
/// With `clusters`, each cluster is its own peer group and meters without an
/// assignment belong to none.
pub fn compute_peer_medians(
    series: &[PeriodSeries],
    clusters: Option<&BTreeMap<MeterId, ClusterId>>,
) -> BTreeMap<PeerKey, PeerMedian> {
    let mut volumes: BTreeMap<PeerKey, Vec<f64>> = BTreeMap::new();
    for row in series {
        if let Some(group) = peer_group(&row.meter_id, clusters) {
            volumes
                .entry((group, row.period))
                .or_default()
                .push(row.aggregated_volume);
        }
    }

    volumes
        .into_iter()
        .filter_map(|((group, period), vols)| {
            median(&vols).map(|median_volume| {
                (
                    (group, period),
                    PeerMedian {
                        period,
                        cluster_id: group,
                        median_volume,
                        n_peers: vols.len(),
                    },
                )
            })
        })
        .collect()
}

/// `volume / (peer_median + ε)`; `None` when both are exactly zero
pub fn normalize_value(volume: f64, peer_median: f64) -> Option<f64> {
    if peer_median == 0.0 && volume == 0.0 {
        return None;
    }
    Some((volume / (peer_median + PEER_EPSILON)).max(0.0))
}

/// Normalise every meter's series against its peer group
pub fn normalize_series(
    series: &[PeriodSeries],
    clusters: Option<&BTreeMap<MeterId, ClusterId>>,
) -> NormalizedSet {
    let medians = compute_peer_medians(series, clusters);
    let grouped: Vec<(MeterId, Vec<(Period, f64)>)> = group_by_meter(series).into_iter().collect();

    // Per-meter pass; `medians` is read-only from here on
    let normalized: Vec<(MeterId, Vec<NormalizedPoint>, usize)> = grouped
        .par_iter()
        .map(|(meter_id, points)| {
            let group = peer_group(meter_id, clusters);
            let mut out = Vec::with_capacity(points.len());
            let mut no_peers = 0usize;
            for (period, volume) in points {
                let peer = group.and_then(|g| medians.get(&(g, *period)));
                match peer {
                    Some(peer) => {
                        if let Some(x_norm) = normalize_value(*volume, peer.median_volume) {
                            out.push(NormalizedPoint {
                                period: *period,
                                aggregated_volume: *volume,
                                peer_median: peer.median_volume,
                                x_norm,
                            });
                        }
                    }
                    None => no_peers += 1,
                }
            }
            (meter_id.clone(), out, no_peers)
        })
        .collect();

    let mut result = NormalizedSet {
        peer_medians: medians.into_values().collect(),
        ..Default::default()
    };

    for (meter_id, points, no_peers) in normalized {
        if no_peers > 0 {
            log::debug!("meter {}: {} period(s) without peers", meter_id, no_peers);
            result.fallbacks.push(Fallback::MissingPeers {
                meter_id: meter_id.clone(),
                periods: no_peers,
            });
        }
        if !points.is_empty() {
            result.series.insert(meter_id, points);
        }
    }

    let missing = result.fallbacks.entries.len();
    if missing > 0 {
        log::warn!(
            "{} meter(s) had periods without a peer group; those periods were skipped",
            missing
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn period(m: u32) -> Period {
        Period(NaiveDate::from_ymd_opt(2023, m, 1).unwrap())
    }

    fn row(meter: &str, m: u32, v: f64) -> PeriodSeries {
        PeriodSeries {
            meter_id: MeterId::from(meter),
            period: period(m),
            aggregated_volume: v,
        }
    }

    #[test]
    fn test_global_median_per_period() {
        let series = vec![
            row("a", 1, 10.0),
            row("b", 1, 20.0),
            row("c", 1, 30.0),
            row("a", 2, 4.0),
            row("b", 2, 8.0),
        ];
        let medians = compute_peer_medians(&series, None);
        assert_eq!(medians[&(None, period(1))].median_volume, 20.0);
        assert_eq!(medians[&(None, period(2))].median_volume, 6.0);
        assert_eq!(medians[&(None, period(2))].n_peers, 2);
    }

    #[test]
    fn test_normalized_relative_to_median() {
        let series = vec![row("a", 1, 10.0), row("b", 1, 20.0), row("c", 1, 30.0)];
        let set = normalize_series(&series, None);
        let a = &set.series[&MeterId::from("a")];
        assert!((a[0].x_norm - 0.5).abs() < 1e-6);
        let c = &set.series[&MeterId::from("c")];
        assert!((c[0].x_norm - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_zero_over_zero_excluded() {
        let series = vec![row("a", 1, 0.0), row("b", 1, 0.0), row("a", 2, 5.0)];
        let set = normalize_series(&series, None);
        assert!(!set.series.contains_key(&MeterId::from("b")));
        assert_eq!(set.series[&MeterId::from("a")].len(), 1);
    }

    #[test]
    fn test_cluster_peers() {
        let series = vec![
            row("a", 1, 10.0),
            row("b", 1, 30.0),
            row("c", 1, 100.0),
            row("d", 1, 7.0),
        ];
        let mut clusters = BTreeMap::new();
        clusters.insert(MeterId::from("a"), 0);
        clusters.insert(MeterId::from("b"), 0);
        clusters.insert(MeterId::from("c"), 1);
        let set = normalize_series(&series, Some(&clusters));

        let a = &set.series[&MeterId::from("a")];
        assert!((a[0].peer_median - 20.0).abs() < 1e-12);
        let c = &set.series[&MeterId::from("c")];
        assert!((c[0].x_norm - 1.0).abs() < 1e-6);
        // "d" has no cluster, so no peers
        assert!(!set.series.contains_key(&MeterId::from("d")));
        assert_eq!(
            set.fallbacks.entries,
            vec![Fallback::MissingPeers {
                meter_id: MeterId::from("d"),
                periods: 1
            }]
        );
    }

    #[test]
    fn test_scaling_a_period_leaves_x_norm_unchanged() {
        let base = vec![row("a", 1, 10.0), row("b", 1, 20.0), row("c", 1, 40.0)];
        let scaled: Vec<PeriodSeries> = base
            .iter()
            .map(|r| PeriodSeries {
                aggregated_volume: r.aggregated_volume * 3.0,
                ..r.clone()
            })
            .collect();
        let x = normalize_series(&base, None);
        let y = normalize_series(&scaled, None);
        for (meter, points) in &x.series {
            let other = &y.series[meter];
            assert!((points[0].x_norm - other[0].x_norm).abs() < 1e-6);
        }
    }
}
