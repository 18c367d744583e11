//! Collapses multi-sample container metrics into per-ContainerSpec
//! commodity values according to the configured strategies.

use core::error::Error;

use derive_more::Display;

use crate::metrics::Point;
use crate::metrics::ThrottlingCumulative;

pub const ALL_UTILIZATION_DATA: &str = "allUtilizationData";
pub const MAX_UTILIZATION_DATA: &str = "maxUtilizationData";
pub const AVERAGE_USAGE_DATA: &str = "averageUsageData";
pub const MAX_USAGE_DATA: &str = "maxUsageData";

pub const DEFAULT_UTILIZATION_DATA_AGG_STRATEGY: &str = MAX_UTILIZATION_DATA;
pub const DEFAULT_USAGE_DATA_AGG_STRATEGY: &str = MAX_USAGE_DATA;

#[derive(Debug, Display)]
pub enum AggregationError {
    #[display("unknown aggregation strategy: {name}")]
    UnknownStrategy { name: String },
    #[display("no used samples for commodity")]
    MissingUsed,
    #[display("no capacity samples for commodity")]
    MissingCapacity,
}

impl Error for AggregationError {}

/// Strategy producing the list of `(timestamp, utilization%)` points for
/// a commodity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtilizationDataStrategy {
    /// Every sample becomes a utilization point.
    All,
    /// Only the single highest-utilization point is kept.
    Max,
}

impl UtilizationDataStrategy {
    pub fn from_name(name: &str) -> Result<Self, AggregationError> {
        match name {
            ALL_UTILIZATION_DATA => Ok(Self::All),
            MAX_UTILIZATION_DATA => Ok(Self::Max),
            _ => Err(AggregationError::UnknownStrategy {
                name: name.to_string(),
            }),
        }
    }

    /// Turns used points into utilization points against `capacity`.
    pub fn aggregate(&self, used: &[Point], capacity: f64) -> Vec<Point> {
        if capacity <= 0.0 {
            return Vec::new();
        }
        let utilization = used.iter().map(|p| Point {
            value: p.value / capacity * 100.0,
            timestamp: p.timestamp,
        });
        match self {
            Self::All => utilization.collect(),
            Self::Max => utilization
                .reduce(|a, b| if b.value > a.value { b } else { a })
                .into_iter()
                .collect(),
        }
    }
}

/// Strategy producing the `used`/`peak`/`capacity` scalars for a
/// commodity from the pooled replica samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageDataStrategy {
    Average,
    Max,
}

impl UsageDataStrategy {
    pub fn from_name(name: &str) -> Result<Self, AggregationError> {
        match name {
            AVERAGE_USAGE_DATA => Ok(Self::Average),
            MAX_USAGE_DATA => Ok(Self::Max),
            _ => Err(AggregationError::UnknownStrategy {
                name: name.to_string(),
            }),
        }
    }

    pub fn aggregate(
        &self,
        used: &[Point],
        capacities: &[f64],
    ) -> Result<UsageData, AggregationError> {
        if used.is_empty() {
            return Err(AggregationError::MissingUsed);
        }
        if capacities.is_empty() {
            return Err(AggregationError::MissingCapacity);
        }

        let (avg, peak) = points_avg_peak(used).ok_or(AggregationError::MissingUsed)?;
        let capacity = match self {
            Self::Average => capacities.iter().sum::<f64>() / capacities.len() as f64,
            Self::Max => capacities.iter().fold(f64::MIN, |a, &b| a.max(b)),
        };

        Ok(UsageData {
            used: avg,
            peak,
            capacity,
        })
    }
}

/// Aggregated `used`/`peak`/`capacity` scalars for one commodity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageData {
    pub used: f64,
    pub peak: f64,
    pub capacity: f64,
}

/// Average and max of a point series.
pub fn points_avg_peak(points: &[Point]) -> Option<(f64, f64)> {
    if points.is_empty() {
        return None;
    }
    let sum: f64 = points.iter().map(|p| p.value).sum();
    let peak = points.iter().map(|p| p.value).fold(f64::MIN, f64::max);
    Some((sum / points.len() as f64, peak))
}

/// An accepted delta interval of a cumulative throttling series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaInterval {
    pub throttled: f64,
    pub total: f64,
}

/// A cumulative counter series with explicit reset handling. Counters
/// reset to zero (or to an arbitrary earlier value) when the container
/// restarts; any interval with a negative delta is discarded and a new
/// window starts after it.
#[derive(Debug, Clone)]
pub struct CumulativeSeries {
    samples: Vec<ThrottlingCumulative>,
}

impl CumulativeSeries {
    pub fn new(mut samples: Vec<ThrottlingCumulative>) -> Self {
        samples.sort_by_key(|s| s.timestamp);
        Self { samples }
    }

    /// Splits the series into windows of monotonic growth. Each window
    /// holds the per-interval deltas of consecutive samples; intervals
    /// where either counter decreased are dropped entirely.
    pub fn delta_windows(&self) -> Vec<Vec<DeltaInterval>> {
        let mut windows = Vec::new();
        let mut current = Vec::new();

        for pair in self.samples.windows(2) {
            let d_throttled = pair[1].throttled - pair[0].throttled;
            let d_total = pair[1].total - pair[0].total;
            if d_throttled < 0.0 || d_total < 0.0 {
                if !current.is_empty() {
                    windows.push(std::mem::take(&mut current));
                }
                continue;
            }
            current.push(DeltaInterval {
                throttled: d_throttled,
                total: d_total,
            });
        }
        if !current.is_empty() {
            windows.push(current);
        }
        windows
    }

    /// Aggregates the series into `(avg, peak)` throttling percentages.
    /// `avg` is the throttled share of all accepted periods; `peak` is
    /// the worst single interval. Returns `None` when no interval
    /// carries any periods.
    pub fn avg_peak(&self) -> Option<(f64, f64)> {
        let intervals: Vec<DeltaInterval> =
            self.delta_windows().into_iter().flatten().collect();
        if intervals.is_empty() {
            return None;
        }

        let sum_throttled: f64 = intervals.iter().map(|i| i.throttled).sum();
        let sum_total: f64 = intervals.iter().map(|i| i.total).sum();
        if sum_total <= 0.0 {
            return None;
        }

        let avg = sum_throttled * 100.0 / sum_total;
        let peak = intervals
            .iter()
            .filter(|i| i.total > 0.0)
            .map(|i| i.throttled * 100.0 / i.total)
            .fold(0.0, f64::max);
        Some((avg, peak))
    }
}

/// Aggregates pooled throttling series of all replicas of a container
/// spec into one `(avg, peak)` pair.
pub fn aggregate_throttling(series: &[Vec<ThrottlingCumulative>]) -> Option<(f64, f64)> {
    let mut intervals: Vec<DeltaInterval> = Vec::new();
    for samples in series {
        intervals.extend(
            CumulativeSeries::new(samples.clone())
                .delta_windows()
                .into_iter()
                .flatten(),
        );
    }
    if intervals.is_empty() {
        return None;
    }

    let sum_throttled: f64 = intervals.iter().map(|i| i.throttled).sum();
    let sum_total: f64 = intervals.iter().map(|i| i.total).sum();
    if sum_total <= 0.0 {
        return None;
    }
    let avg = sum_throttled * 100.0 / sum_total;
    let peak = intervals
        .iter()
        .filter(|i| i.total > 0.0)
        .map(|i| i.throttled * 100.0 / i.total)
        .fold(0.0, f64::max);
    Some((avg, peak))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tc(throttled: f64, total: f64, timestamp: i64) -> ThrottlingCumulative {
        ThrottlingCumulative {
            throttled,
            total,
            timestamp,
        }
    }

    fn pt(value: f64, timestamp: i64) -> Point {
        Point { value, timestamp }
    }

    #[test]
    fn monotonic_series_aggregates_over_full_span() {
        let series = CumulativeSeries::new(vec![
            tc(1.0, 5.0, 1),
            tc(3.0, 8.0, 2),
            tc(5.0, 10.0, 3),
            tc(6.0, 15.0, 4),
            tc(11.0, 25.0, 5),
        ]);

        let (avg, peak) = series.avg_peak().unwrap();
        // avg = (11-1)*100/(25-5), peak from the (3,8)->(5,10) interval
        assert_eq!(avg as i64, 50);
        assert_eq!(peak as i64, 100);

        // Without resets, avg * total periods equals throttled * 100.
        let sum_throttled = 11.0 - 1.0;
        let sum_total = 25.0 - 5.0;
        assert!((avg * sum_total - sum_throttled * 100.0).abs() < 1e-9);
    }

    #[test]
    fn counter_resets_split_windows() {
        // Counters reset at t6 and again fall back to earlier values at
        // t9 and t11; the reset intervals must be discarded.
        let series = CumulativeSeries::new(vec![
            tc(1.0, 5.0, 1),
            tc(3.0, 8.0, 2),
            tc(5.0, 10.0, 3),
            tc(6.0, 15.0, 4),
            tc(11.0, 25.0, 5),
            tc(0.0, 0.0, 6),
            tc(1.0, 5.0, 7),
            tc(3.0, 8.0, 8),
            tc(1.0, 5.0, 9),
            tc(3.0, 8.0, 10),
            tc(1.0, 5.0, 10),
        ]);

        let windows = series.delta_windows();
        assert_eq!(windows.len(), 3);

        // avg = ((11-1)+(3-0)+(3-1))*100 / ((25-5)+(8-0)+(8-5)) = 48.38
        let (avg, peak) = series.avg_peak().unwrap();
        assert_eq!(avg as i64, 48);
        assert_eq!(peak as i64, 100);
    }

    #[test]
    fn reset_interval_removal_is_equivalent() {
        let with_reset = CumulativeSeries::new(vec![
            tc(1.0, 5.0, 1),
            tc(3.0, 8.0, 2),
            tc(0.0, 0.0, 3),
            tc(2.0, 4.0, 4),
        ]);

        // Splitting the same samples into the two monotonic runs (the
        // reset interval removed) must aggregate identically.
        let split = vec![
            vec![tc(1.0, 5.0, 1), tc(3.0, 8.0, 2)],
            vec![tc(0.0, 0.0, 3), tc(2.0, 4.0, 4)],
        ];

        assert_eq!(with_reset.avg_peak(), aggregate_throttling(&split));
    }

    #[test]
    fn single_sample_has_no_intervals() {
        let series = CumulativeSeries::new(vec![tc(1.0, 5.0, 1)]);
        assert!(series.delta_windows().is_empty());
        assert!(series.avg_peak().is_none());
    }

    #[test]
    fn unsorted_samples_are_ordered_by_timestamp() {
        let series = CumulativeSeries::new(vec![
            tc(5.0, 10.0, 3),
            tc(1.0, 5.0, 1),
            tc(3.0, 8.0, 2),
        ]);
        let windows = series.delta_windows();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].len(), 2);
        assert_eq!(windows[0][0].throttled, 2.0);
    }

    #[test]
    fn usage_aggregation_avg_and_peak() {
        let used = vec![pt(1.0, 1), pt(3.0, 2)];
        let capacities = vec![3.0, 4.0];

        let max = UsageDataStrategy::Max.aggregate(&used, &capacities).unwrap();
        assert_eq!(max.used, 2.0);
        assert_eq!(max.peak, 3.0);
        assert_eq!(max.capacity, 4.0);

        let avg = UsageDataStrategy::Average
            .aggregate(&used, &capacities)
            .unwrap();
        assert_eq!(avg.used, 2.0);
        assert_eq!(avg.capacity, 3.5);
    }

    #[test]
    fn usage_aggregation_requires_samples() {
        assert!(matches!(
            UsageDataStrategy::Max.aggregate(&[], &[1.0]),
            Err(AggregationError::MissingUsed)
        ));
        assert!(matches!(
            UsageDataStrategy::Max.aggregate(&[pt(1.0, 1)], &[]),
            Err(AggregationError::MissingCapacity)
        ));
    }

    #[test]
    fn utilization_strategies() {
        let used = vec![pt(1.0, 1), pt(3.0, 2), pt(2.0, 3)];

        let all = UtilizationDataStrategy::All.aggregate(&used, 4.0);
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].value, 75.0);

        let max = UtilizationDataStrategy::Max.aggregate(&used, 4.0);
        assert_eq!(max.len(), 1);
        assert_eq!(max[0].value, 75.0);
        assert_eq!(max[0].timestamp, 2);
    }

    #[test]
    fn strategy_names_resolve() {
        assert_eq!(
            UtilizationDataStrategy::from_name(DEFAULT_UTILIZATION_DATA_AGG_STRATEGY).unwrap(),
            UtilizationDataStrategy::Max
        );
        assert_eq!(
            UsageDataStrategy::from_name(DEFAULT_USAGE_DATA_AGG_STRATEGY).unwrap(),
            UsageDataStrategy::Max
        );
        assert!(UtilizationDataStrategy::from_name("bogus").is_err());
    }
}
