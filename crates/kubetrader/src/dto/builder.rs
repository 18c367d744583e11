//! General commodity builder: looks metric values up in the sink,
//! aggregates sample rings and applies the CPU frequency conversion.

use core::error::Error;

use derive_more::Display;

use super::types::CommodityDto;
use super::types::CommodityType;
use crate::aggregation::points_avg_peak;
use crate::aggregation::CumulativeSeries;
use crate::aggregation::UtilizationDataStrategy;
use crate::metrics::EntityKind;
use crate::metrics::EntityMetricSink;
use crate::metrics::Point;
use crate::metrics::ResourceKind;
use crate::metrics::SampleKind;
use crate::metrics::SampleValue;

#[derive(Debug, Display)]
pub enum BuildError {
    #[display("missing {sample_kind:?} sample for {entity_kind:?} {entity_key} {resource:?}")]
    MissingMetric {
        entity_kind: EntityKind,
        entity_key: String,
        resource: ResourceKind,
        sample_kind: SampleKind,
    },
    #[display("missing cpu frequency converter for {entity_key}")]
    MissingConverter { entity_key: String },
    #[display("resource {resource:?} has no commodity mapping")]
    UnsupportedResource { resource: ResourceKind },
}

impl Error for BuildError {}

/// Converts millicore values into MHz using the hosting node's CPU
/// frequency.
#[derive(Debug, Clone, Copy)]
pub struct FrequencyConverter {
    mhz: f64,
}

impl FrequencyConverter {
    pub fn new(mhz: f64) -> Self {
        Self { mhz }
    }

    pub fn millicores_to_mhz(&self, millicores: f64) -> f64 {
        millicores / 1000.0 * self.mhz
    }
}

/// An aggregated metric value: the average and the peak over the sample
/// ring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricValue {
    pub avg: f64,
    pub peak: f64,
}

pub struct GeneralBuilder<'a> {
    sink: &'a EntityMetricSink,
}

impl<'a> GeneralBuilder<'a> {
    pub fn new(sink: &'a EntityMetricSink) -> Self {
        Self { sink }
    }

    /// Aggregates the sample ring for the key into `(avg, peak)`. CPU
    /// family values require a frequency converter and come back in MHz.
    pub fn metric_value(
        &self,
        entity_kind: EntityKind,
        entity_key: &str,
        resource: ResourceKind,
        sample_kind: SampleKind,
        converter: Option<&FrequencyConverter>,
    ) -> Result<MetricValue, BuildError> {
        let value = self
            .sink
            .get(entity_kind, entity_key, resource, sample_kind)
            .ok_or_else(|| BuildError::MissingMetric {
                entity_kind,
                entity_key: entity_key.to_string(),
                resource,
                sample_kind,
            })?;

        let (avg, peak) = match &value {
            SampleValue::Scalar(v) => (*v, *v),
            SampleValue::Points(points) => {
                points_avg_peak(points).ok_or_else(|| BuildError::MissingMetric {
                    entity_kind,
                    entity_key: entity_key.to_string(),
                    resource,
                    sample_kind,
                })?
            }
            SampleValue::Throttling(samples) => CumulativeSeries::new(samples.clone())
                .avg_peak()
                .ok_or_else(|| BuildError::MissingMetric {
                    entity_kind,
                    entity_key: entity_key.to_string(),
                    resource,
                    sample_kind,
                })?,
        };

        if resource.is_cpu_family() {
            let converter = converter.ok_or_else(|| BuildError::MissingConverter {
                entity_key: entity_key.to_string(),
            })?;
            return Ok(MetricValue {
                avg: converter.millicores_to_mhz(avg),
                peak: converter.millicores_to_mhz(peak),
            });
        }

        Ok(MetricValue { avg, peak })
    }

    /// Builds a sold commodity for the resource, requiring both used and
    /// capacity samples.
    pub fn sold_commodity_with_key(
        &self,
        entity_kind: EntityKind,
        entity_key: &str,
        resource: ResourceKind,
        key: Option<&str>,
        converter: Option<&FrequencyConverter>,
        utilization: Option<UtilizationDataStrategy>,
    ) -> Result<CommodityDto, BuildError> {
        let commodity_type = CommodityType::from_resource(resource)
            .ok_or(BuildError::UnsupportedResource { resource })?;

        let used =
            self.metric_value(entity_kind, entity_key, resource, SampleKind::Used, converter)?;
        let capacity = self.metric_value(
            entity_kind,
            entity_key,
            resource,
            SampleKind::Capacity,
            converter,
        )?;

        let mut commodity = CommodityDto::new(commodity_type, used.avg)
            .with_peak(used.peak)
            .with_capacity(capacity.avg);
        if let Some(key) = key {
            commodity = commodity.with_key(key.to_string());
        }

        if let Some(strategy) = utilization {
            if let Some(SampleValue::Points(points)) =
                self.sink
                    .get(entity_kind, entity_key, resource, SampleKind::Used)
            {
                let raw_capacity = match self.sink.get(
                    entity_kind,
                    entity_key,
                    resource,
                    SampleKind::Capacity,
                ) {
                    Some(SampleValue::Scalar(v)) => v,
                    _ => 0.0,
                };
                commodity.utilization_points = strategy.aggregate(&points, raw_capacity);
            }
        }

        Ok(commodity)
    }

    /// Builds a bought commodity for the resource; only the used value
    /// is required on the buyer side.
    pub fn bought_commodity_with_key(
        &self,
        entity_kind: EntityKind,
        entity_key: &str,
        resource: ResourceKind,
        key: Option<&str>,
        converter: Option<&FrequencyConverter>,
    ) -> Result<CommodityDto, BuildError> {
        let commodity_type = CommodityType::from_resource(resource)
            .ok_or(BuildError::UnsupportedResource { resource })?;

        let used =
            self.metric_value(entity_kind, entity_key, resource, SampleKind::Used, converter)?;

        let mut commodity = CommodityDto::new(commodity_type, used.avg).with_peak(used.peak);
        if let Some(key) = key {
            commodity = commodity.with_key(key.to_string());
        }
        Ok(commodity)
    }

    /// Raw used points for the key, if the ring holds a point series.
    pub fn used_points(
        &self,
        entity_kind: EntityKind,
        entity_key: &str,
        resource: ResourceKind,
    ) -> Option<Vec<Point>> {
        match self
            .sink
            .get(entity_kind, entity_key, resource, SampleKind::Used)
        {
            Some(SampleValue::Points(points)) => Some(points),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::SampleValue;

    const POD: &str = "default/pod1";

    fn sink_with(entries: &[(ResourceKind, SampleKind, SampleValue)]) -> EntityMetricSink {
        let sink = EntityMetricSink::new();
        for (resource, kind, value) in entries {
            sink.add(EntityKind::Pod, POD, *resource, *kind, value.clone());
        }
        sink
    }

    #[test]
    fn cpu_sold_commodity_converts_to_mhz() {
        let sink = sink_with(&[
            (
                ResourceKind::CpuMillicore,
                SampleKind::Used,
                SampleValue::point(1000.0, 1),
            ),
            (
                ResourceKind::CpuMillicore,
                SampleKind::Capacity,
                SampleValue::Scalar(2000.0),
            ),
        ]);
        let builder = GeneralBuilder::new(&sink);
        let converter = FrequencyConverter::new(2048.0);

        let commodity = builder
            .sold_commodity_with_key(
                EntityKind::Pod,
                POD,
                ResourceKind::CpuMillicore,
                None,
                Some(&converter),
                None,
            )
            .unwrap();

        assert_eq!(commodity.commodity_type, CommodityType::VCpu);
        assert_eq!(commodity.used, 2048.0);
        assert_eq!(commodity.capacity, Some(4096.0));
    }

    #[test]
    fn memory_sold_commodity_passes_through_in_kib() {
        let sink = sink_with(&[
            (
                ResourceKind::Memory,
                SampleKind::Used,
                SampleValue::point(1024.0, 1),
            ),
            (
                ResourceKind::Memory,
                SampleKind::Capacity,
                SampleValue::Scalar(4096.0),
            ),
        ]);
        let builder = GeneralBuilder::new(&sink);

        let commodity = builder
            .sold_commodity_with_key(EntityKind::Pod, POD, ResourceKind::Memory, None, None, None)
            .unwrap();

        assert_eq!(commodity.commodity_type, CommodityType::VMem);
        assert_eq!(commodity.used, 1024.0);
        assert_eq!(commodity.capacity, Some(4096.0));
    }

    #[test]
    fn missing_capacity_is_an_error() {
        let sink = sink_with(&[(
            ResourceKind::CpuMillicore,
            SampleKind::Used,
            SampleValue::point(100.0, 1),
        )]);
        let builder = GeneralBuilder::new(&sink);
        let converter = FrequencyConverter::new(2048.0);

        let result = builder.sold_commodity_with_key(
            EntityKind::Pod,
            POD,
            ResourceKind::CpuMillicore,
            None,
            Some(&converter),
            None,
        );
        assert!(matches!(result, Err(BuildError::MissingMetric { .. })));
    }

    #[test]
    fn missing_used_is_an_error() {
        let sink = sink_with(&[(
            ResourceKind::CpuMillicore,
            SampleKind::Capacity,
            SampleValue::Scalar(2000.0),
        )]);
        let builder = GeneralBuilder::new(&sink);
        let converter = FrequencyConverter::new(2048.0);

        let result = builder.sold_commodity_with_key(
            EntityKind::Pod,
            POD,
            ResourceKind::CpuMillicore,
            None,
            Some(&converter),
            None,
        );
        assert!(matches!(result, Err(BuildError::MissingMetric { .. })));
    }

    #[test]
    fn cpu_commodity_requires_a_converter() {
        let sink = sink_with(&[
            (
                ResourceKind::CpuMillicore,
                SampleKind::Used,
                SampleValue::point(100.0, 1),
            ),
            (
                ResourceKind::CpuMillicore,
                SampleKind::Capacity,
                SampleValue::Scalar(2000.0),
            ),
        ]);
        let builder = GeneralBuilder::new(&sink);

        let result = builder.sold_commodity_with_key(
            EntityKind::Pod,
            POD,
            ResourceKind::CpuMillicore,
            None,
            None,
            None,
        );
        assert!(matches!(result, Err(BuildError::MissingConverter { .. })));
    }

    #[test]
    fn commodity_key_is_attached() {
        let sink = sink_with(&[
            (
                ResourceKind::Memory,
                SampleKind::Used,
                SampleValue::point(1.0, 1),
            ),
            (
                ResourceKind::Memory,
                SampleKind::Capacity,
                SampleValue::Scalar(2.0),
            ),
        ]);
        let builder = GeneralBuilder::new(&sink);

        let commodity = builder
            .sold_commodity_with_key(
                EntityKind::Pod,
                POD,
                ResourceKind::Memory,
                Some("pod-uid"),
                None,
                None,
            )
            .unwrap();
        assert_eq!(commodity.key.as_deref(), Some("pod-uid"));
    }

    #[test]
    fn metric_value_with_multiple_points() {
        let sink = EntityMetricSink::new().with_max_metric_points(3);
        for (v, t) in [(2.0, 1), (4.0, 2), (3.0, 3)] {
            sink.add(
                EntityKind::Container,
                "c1",
                ResourceKind::CpuMillicore,
                SampleKind::Used,
                SampleValue::point(v, t),
            );
        }
        let builder = GeneralBuilder::new(&sink);
        let converter = FrequencyConverter::new(1000.0);

        let value = builder
            .metric_value(
                EntityKind::Container,
                "c1",
                ResourceKind::CpuMillicore,
                SampleKind::Used,
                Some(&converter),
            )
            .unwrap();
        assert_eq!(value.avg as i64, 3);
        assert_eq!(value.peak as i64, 4);
    }

    #[test]
    fn metric_value_with_throttling_cumulative_points() {
        let sink = EntityMetricSink::new().with_max_metric_points(11);
        let samples = [
            (1.0, 5.0, 1),
            (3.0, 8.0, 2),
            (5.0, 10.0, 3),
            (6.0, 15.0, 4),
            (11.0, 25.0, 5),
            (0.0, 0.0, 6),
            (1.0, 5.0, 7),
            (3.0, 8.0, 8),
            (1.0, 5.0, 9),
            (3.0, 8.0, 10),
            (1.0, 5.0, 10),
        ];
        for (throttled, total, t) in samples {
            sink.add(
                EntityKind::Container,
                "c1",
                ResourceKind::VcpuThrottling,
                SampleKind::Used,
                SampleValue::throttling(throttled, total, t),
            );
        }
        let builder = GeneralBuilder::new(&sink);

        let value = builder
            .metric_value(
                EntityKind::Container,
                "c1",
                ResourceKind::VcpuThrottling,
                SampleKind::Used,
                None,
            )
            .unwrap();
        assert_eq!(value.avg as i64, 48);
        assert_eq!(value.peak as i64, 100);
    }

    #[test]
    fn utilization_points_follow_the_strategy() {
        let sink = sink_with(&[
            (
                ResourceKind::Memory,
                SampleKind::Used,
                SampleValue::Points(vec![
                    Point {
                        value: 1.0,
                        timestamp: 1,
                    },
                    Point {
                        value: 3.0,
                        timestamp: 2,
                    },
                ]),
            ),
            (
                ResourceKind::Memory,
                SampleKind::Capacity,
                SampleValue::Scalar(4.0),
            ),
        ]);
        let builder = GeneralBuilder::new(&sink);

        let commodity = builder
            .sold_commodity_with_key(
                EntityKind::Pod,
                POD,
                ResourceKind::Memory,
                None,
                None,
                Some(UtilizationDataStrategy::All),
            )
            .unwrap();
        assert_eq!(commodity.utilization_points.len(), 2);
        assert_eq!(commodity.utilization_points[1].value, 75.0);
    }
}
