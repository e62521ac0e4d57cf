//! Daily consumption → per-meter period series
//!
//! Global invariants enforced:
//! - Period volume is the SUM of the daily volumes falling in it
//! - A meter with no records in a period has no row for it (absent, not zero)
//! - Output is ordered by meter, then period

use crate::types::{ConsumptionRecord, MeterId, Period, PeriodSeries};
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Calendar bucket used for aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationFrequency {
    #[default]
    Monthly,
    /// Monday-to-Sunday weeks
    Weekly,
}

impl AggregationFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationFrequency::Monthly => "monthly",
            AggregationFrequency::Weekly => "weekly",
        }
    }

    /// First day of the period containing `date`
    pub fn period_of(&self, date: NaiveDate) -> Period {
        match self {
            AggregationFrequency::Monthly => Period(date.with_day(1).unwrap_or(date)),
            AggregationFrequency::Weekly => {
                let offset = date.weekday().num_days_from_monday() as i64;
                Period(date - Duration::days(offset))
            }
        }
    }
}

impl FromStr for AggregationFrequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "monthly" | "month" | "m" => Ok(AggregationFrequency::Monthly),
            "weekly" | "week" | "w" => Ok(AggregationFrequency::Weekly),
            other => Err(format!(
                "unknown aggregation frequency '{}' (expected monthly or weekly)",
                other
            )),
        }
    }
}

/// Start of the `frequency` period containing `date`
pub fn period_start(date: NaiveDate, frequency: AggregationFrequency) -> Period {
    frequency.period_of(date)
}

/// Aggregate daily records into period sums.
///
/// Empty input yields empty output.
pub fn aggregate_periods(
    records: &[ConsumptionRecord],
    frequency: AggregationFrequency,
) -> Vec<PeriodSeries> {
    let mut sums: BTreeMap<(MeterId, Period), f64> = BTreeMap::new();

    for record in records {
        let period = period_start(record.date, frequency);
        *sums
            .entry((record.meter_id.clone(), period))
            .or_insert(0.0) += record.volume;
    }

    let series: Vec<PeriodSeries> = sums
        .into_iter()
        .map(|((meter_id, period), aggregated_volume)| PeriodSeries {
            meter_id,
            period,
            aggregated_volume,
        })
        .collect();

    log::debug!(
        "aggregated {} daily records into {} {} rows",
        records.len(),
        series.len(),
        frequency.as_str()
    );

    series
}

/// Group period rows by meter, each meter's points ordered by period
pub fn group_by_meter(series: &[PeriodSeries]) -> BTreeMap<MeterId, Vec<(Period, f64)>> {
    let mut grouped: BTreeMap<MeterId, Vec<(Period, f64)>> = BTreeMap::new();
    for row in series {
        grouped
            .entry(row.meter_id.clone())
            .or_default()
            .push((row.period, row.aggregated_volume));
    }
    for points in grouped.values_mut() {
        points.sort_by_key(|(period, _)| *period);
    }
    grouped
}

/// Number of meters with fewer than `min_periods` periods (kept, but low-confidence)
pub fn count_short_histories(series: &[PeriodSeries], min_periods: usize) -> usize {
    group_by_meter(series)
        .values()
        .filter(|points| points.len() < min_periods)
        .count()
}
