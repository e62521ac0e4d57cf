//! End-to-end scoring run
//!
//! Wires the stages together:
//! consumption → aggregate → peer-normalise → indicators → subcount score;
//! latent + clusters → anomaly; physical + clusters → degradation;
//! all three → combined risk table.
//!
//! Global invariants enforced:
//! - Every input is validated before any stage runs (fail fast, no partial table)
//! - The risk population is the latent-vector table; each member gets one record
//! - Population bounds are computed inside this call and never reused

use crate::aggregate::{aggregate_periods, count_short_histories};
use crate::anomaly::{compute_anomaly_scores, latent_dim};
use crate::combine::{combine_risk, RiskRecord};
use crate::config::ResolvedConfig;
use crate::degradation::{compute_cluster_degradation, ClusterDegradation};
use crate::error::{FallbackLog, PipelineError, PipelineResult};
use crate::inputs::{CLUSTER_TABLE, CONSUMPTION_TABLE, LATENT_TABLE, PHYSICAL_TABLE};
use crate::peer::normalize_series;
use crate::report::sort_records;
use crate::subcount::{compute_subcounting_metrics, SubcountingMetrics, SubcountingParams};
use crate::summary::{compute_cluster_summaries, ClusterSummary};
use crate::types::{
    ClusterAssignment, ClusterId, ConsumptionRecord, LatentVector, MeterId, PhysicalFeatures,
};
use std::collections::{BTreeMap, BTreeSet};

/// Fully materialised upstream tables for one run
#[derive(Debug, Clone, Default)]
pub struct PipelineInputs {
    pub consumption: Vec<ConsumptionRecord>,
    pub clusters: Vec<ClusterAssignment>,
    pub latent: Vec<LatentVector>,
    pub physical: Vec<PhysicalFeatures>,
}

/// Everything one run produces
#[derive(Debug, Clone, Default)]
pub struct RiskTable {
    /// One record per meter, highest risk first
    pub records: Vec<RiskRecord>,
    pub summaries: Vec<ClusterSummary>,
    pub subcounting: Vec<SubcountingMetrics>,
    pub degradation: BTreeMap<ClusterId, ClusterDegradation>,
    pub fallbacks: FallbackLog,
}

/// Index cluster assignments by meter; a meter may appear only once
pub fn cluster_map(
    assignments: &[ClusterAssignment],
) -> PipelineResult<BTreeMap<MeterId, ClusterId>> {
    let mut map = BTreeMap::new();
    for a in assignments {
        if map.insert(a.meter_id.clone(), a.cluster_id).is_some() {
            return Err(PipelineError::schema(
                CLUSTER_TABLE,
                format!("duplicate assignment for meter {}", a.meter_id),
            ));
        }
    }
    Ok(map)
}

fn check_consumption(records: &[ConsumptionRecord]) -> PipelineResult<()> {
    if let Some(bad) = records
        .iter()
        .find(|r| !r.volume.is_finite() || r.volume < 0.0)
    {
        return Err(PipelineError::schema(
            CONSUMPTION_TABLE,
            format!(
                "meter {} on {}: volume must be finite and >= 0, got {}",
                bad.meter_id, bad.date, bad.volume
            ),
        ));
    }
    Ok(())
}

fn check_physical(features: &[PhysicalFeatures]) -> PipelineResult<()> {
    let mut seen = BTreeSet::new();
    for f in features {
        if !seen.insert(&f.meter_id) {
            return Err(PipelineError::schema(
                PHYSICAL_TABLE,
                format!("duplicate row for meter {}", f.meter_id),
            ));
        }
        for (name, v) in [("age", f.age), ("canya", f.canya)] {
            if !v.is_finite() || v < 0.0 {
                return Err(PipelineError::schema(
                    PHYSICAL_TABLE,
                    format!(
                        "meter {}: {} must be finite and >= 0, got {}",
                        f.meter_id, name, v
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn check_latent(vectors: &[LatentVector]) -> PipelineResult<()> {
    latent_dim(vectors)?;
    if let Some(bad) = vectors
        .iter()
        .find(|v| v.values.iter().any(|x| !x.is_finite()))
    {
        return Err(PipelineError::schema(
            LATENT_TABLE,
            format!("meter {}: latent values must be finite", bad.meter_id),
        ));
    }
    Ok(())
}

/// Subcounting metrics for every meter with at least one normalised period.
///
/// `clusters` is required when cluster peers are enabled. A disabled stage
/// yields no metrics.
pub fn run_subcounting(
    consumption: &[ConsumptionRecord],
    clusters: Option<&BTreeMap<MeterId, ClusterId>>,
    params: &SubcountingParams,
) -> PipelineResult<(Vec<SubcountingMetrics>, FallbackLog)> {
    if !params.enabled {
        log::info!("subcounting: disabled");
        return Ok((Vec::new(), FallbackLog::new()));
    }
    check_consumption(consumption)?;

    let peers = if params.use_cluster_peers {
        Some(clusters.ok_or_else(|| {
            PipelineError::missing(
                CLUSTER_TABLE,
                "cluster peers are enabled but no cluster assignments were supplied",
            )
        })?)
    } else {
        None
    };

    let series = aggregate_periods(consumption, params.frequency);
    log::debug!(
        "subcounting: {} meter(s) below {} periods",
        count_short_histories(&series, params.indicators.min_periods),
        params.indicators.min_periods
    );
    let normalized = normalize_series(&series, peers);
    log::info!(
        "subcounting: {} meter(s), {} peer group-period(s), {} peers",
        normalized.series.len(),
        normalized.peer_medians.len(),
        if peers.is_some() { "cluster" } else { "global" }
    );

    let mut fallbacks = normalized.fallbacks;
    let (metrics, scorer_fallbacks) = compute_subcounting_metrics(&normalized.series, params);
    fallbacks.extend(scorer_fallbacks);
    Ok((metrics, fallbacks))
}

/// Run the full scoring pipeline
pub fn run(inputs: &PipelineInputs, config: &ResolvedConfig) -> PipelineResult<RiskTable> {
    // Validation before any scoring
    if inputs.latent.is_empty() {
        return Err(PipelineError::missing(LATENT_TABLE, "no latent vectors supplied"));
    }
    let clusters = cluster_map(&inputs.clusters)?;
    check_latent(&inputs.latent)?;
    check_physical(&inputs.physical)?;

    let physical_by_meter: BTreeMap<&MeterId, &PhysicalFeatures> = inputs
        .physical
        .iter()
        .map(|f| (&f.meter_id, f))
        .collect();
    let mut population = BTreeSet::new();
    let mut physical = Vec::with_capacity(inputs.latent.len());
    for v in &inputs.latent {
        if !population.insert(&v.meter_id) {
            return Err(PipelineError::schema(
                LATENT_TABLE,
                format!("duplicate latent vector for meter {}", v.meter_id),
            ));
        }
        if !clusters.contains_key(&v.meter_id) {
            return Err(PipelineError::missing(
                CLUSTER_TABLE,
                format!("no cluster assignment for meter {}", v.meter_id),
            ));
        }
        match physical_by_meter.get(&v.meter_id) {
            Some(f) => physical.push((*f).clone()),
            None => {
                return Err(PipelineError::missing(
                    PHYSICAL_TABLE,
                    format!("no physical features for meter {}", v.meter_id),
                ))
            }
        }
    }
    log::info!(
        "risk population: {} meter(s) in {} cluster(s)",
        population.len(),
        inputs
            .latent
            .iter()
            .filter_map(|v| clusters.get(&v.meter_id))
            .collect::<BTreeSet<_>>()
            .len()
    );

    let mut fallbacks = FallbackLog::new();

    let (subcounting, sub_fallbacks) =
        run_subcounting(&inputs.consumption, Some(&clusters), &config.subcounting)?;
    fallbacks.extend(sub_fallbacks);

    let (anomaly, anomaly_fallbacks) = compute_anomaly_scores(
        &inputs.latent,
        &clusters,
        config.anomaly.distance_metric,
    )?;
    fallbacks.extend(anomaly_fallbacks);

    let (degradation, degradation_fallbacks) =
        compute_cluster_degradation(&physical, &clusters, &config.degradation)?;
    fallbacks.extend(degradation_fallbacks);

    let degradation_by_cluster: BTreeMap<ClusterId, f64> = degradation
        .iter()
        .map(|(id, d)| (*id, d.degradation))
        .collect();
    let (records, combine_fallbacks) = combine_risk(
        &anomaly,
        &degradation_by_cluster,
        &subcounting,
        &config.combination,
    );
    fallbacks.extend(combine_fallbacks);

    let records = sort_records(records);
    let summaries = compute_cluster_summaries(&records);

    if !fallbacks.is_empty() {
        log::warn!(
            "{} fallback(s) applied during scoring",
            fallbacks.entries.len()
        );
    }
    log::info!("scored {} meter(s)", records.len());

    Ok(RiskTable {
        records,
        summaries,
        subcounting,
        degradation,
        fallbacks,
    })
}
