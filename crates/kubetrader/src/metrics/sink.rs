//! Append-only keyed store of time-stamped resource samples.
//!
//! One sink is allocated per discovery cycle and written concurrently by
//! the scrape workers; readers run only after the orchestrator barrier.

use std::collections::VecDeque;

use dashmap::DashMap;

use super::types::EntityKind;
use super::types::ResourceKind;
use super::types::SampleKind;
use super::types::SampleValue;

pub const DEFAULT_MAX_METRIC_POINTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MetricKey {
    entity_kind: EntityKind,
    entity_key: String,
    resource: ResourceKind,
    sample_kind: SampleKind,
}

#[derive(Debug, Clone)]
enum Entry {
    Scalar(f64),
    Points(VecDeque<super::types::Point>),
    Throttling(VecDeque<super::types::ThrottlingCumulative>),
}

/// Keyed sample store with a bounded FIFO ring per
/// `(entity, resource, sample kind)`. Entity state markers (health
/// flags) live in their own keyspace.
pub struct EntityMetricSink {
    entries: DashMap<MetricKey, Entry>,
    states: DashMap<(EntityKind, String, &'static str), f64>,
    max_metric_points: usize,
}

impl Default for EntityMetricSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityMetricSink {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            states: DashMap::new(),
            max_metric_points: DEFAULT_MAX_METRIC_POINTS,
        }
    }

    pub fn with_max_metric_points(mut self, max: usize) -> Self {
        self.max_metric_points = max.max(1);
        self
    }

    /// Appends a sample. Scalars replace the previous value; point and
    /// throttling samples extend the ring, evicting the oldest entries
    /// once `max_metric_points` is exceeded.
    pub fn add(
        &self,
        entity_kind: EntityKind,
        entity_key: &str,
        resource: ResourceKind,
        sample_kind: SampleKind,
        value: SampleValue,
    ) {
        let key = MetricKey {
            entity_kind,
            entity_key: entity_key.to_string(),
            resource,
            sample_kind,
        };

        match value {
            SampleValue::Scalar(v) => {
                self.entries.insert(key, Entry::Scalar(v));
            }
            SampleValue::Points(points) => {
                let mut slot = self
                    .entries
                    .entry(key)
                    .or_insert_with(|| Entry::Points(VecDeque::new()));
                match slot.value_mut() {
                    Entry::Points(ring) => {
                        for p in points {
                            if ring.len() == self.max_metric_points {
                                ring.pop_front();
                            }
                            ring.push_back(p);
                        }
                    }
                    other => *other = Entry::Points(points.into_iter().collect()),
                }
            }
            SampleValue::Throttling(samples) => {
                let mut slot = self
                    .entries
                    .entry(key)
                    .or_insert_with(|| Entry::Throttling(VecDeque::new()));
                match slot.value_mut() {
                    Entry::Throttling(ring) => {
                        for s in samples {
                            if ring.len() == self.max_metric_points {
                                ring.pop_front();
                            }
                            ring.push_back(s);
                        }
                    }
                    other => *other = Entry::Throttling(samples.into_iter().collect()),
                }
            }
        }
    }

    /// Returns the ordered ring (or scalar) for the given key, if any.
    pub fn get(
        &self,
        entity_kind: EntityKind,
        entity_key: &str,
        resource: ResourceKind,
        sample_kind: SampleKind,
    ) -> Option<SampleValue> {
        let key = MetricKey {
            entity_kind,
            entity_key: entity_key.to_string(),
            resource,
            sample_kind,
        };
        self.entries.get(&key).map(|entry| match entry.value() {
            Entry::Scalar(v) => SampleValue::Scalar(*v),
            Entry::Points(ring) => SampleValue::Points(ring.iter().copied().collect()),
            Entry::Throttling(ring) => SampleValue::Throttling(ring.iter().copied().collect()),
        })
    }

    /// Sets a named state marker for an entity, e.g. `NodeCacheUsed`.
    pub fn set_state(&self, entity_kind: EntityKind, entity_key: &str, name: &'static str, value: f64) {
        self.states
            .insert((entity_kind, entity_key.to_string(), name), value);
    }

    pub fn state(&self, entity_kind: EntityKind, entity_key: &str, name: &'static str) -> Option<f64> {
        self.states
            .get(&(entity_kind, entity_key.to_string(), name))
            .map(|v| *v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::Point;
    use super::*;

    #[test]
    fn scalar_samples_replace() {
        let sink = EntityMetricSink::new();
        sink.add(
            EntityKind::Node,
            "node1",
            ResourceKind::CpuFrequency,
            SampleKind::Used,
            SampleValue::Scalar(2048.0),
        );
        sink.add(
            EntityKind::Node,
            "node1",
            ResourceKind::CpuFrequency,
            SampleKind::Used,
            SampleValue::Scalar(2400.0),
        );

        let value = sink
            .get(
                EntityKind::Node,
                "node1",
                ResourceKind::CpuFrequency,
                SampleKind::Used,
            )
            .unwrap();
        assert_eq!(value, SampleValue::Scalar(2400.0));
    }

    #[test]
    fn point_ring_evicts_oldest_at_capacity() {
        let sink = EntityMetricSink::new().with_max_metric_points(3);
        for (v, t) in [(1.0, 1), (2.0, 2), (3.0, 3), (4.0, 4), (5.0, 5)] {
            sink.add(
                EntityKind::Container,
                "default/pod/c",
                ResourceKind::CpuMillicore,
                SampleKind::Used,
                SampleValue::point(v, t),
            );
        }

        let value = sink
            .get(
                EntityKind::Container,
                "default/pod/c",
                ResourceKind::CpuMillicore,
                SampleKind::Used,
            )
            .unwrap();
        let SampleValue::Points(points) = value else {
            panic!("expected point series");
        };
        assert_eq!(
            points,
            vec![
                Point {
                    value: 3.0,
                    timestamp: 3
                },
                Point {
                    value: 4.0,
                    timestamp: 4
                },
                Point {
                    value: 5.0,
                    timestamp: 5
                },
            ]
        );
    }

    #[test]
    fn rings_are_isolated_per_key() {
        let sink = EntityMetricSink::new();
        sink.add(
            EntityKind::Pod,
            "default/a",
            ResourceKind::Memory,
            SampleKind::Used,
            SampleValue::point(100.0, 1),
        );
        sink.add(
            EntityKind::Pod,
            "default/b",
            ResourceKind::Memory,
            SampleKind::Used,
            SampleValue::point(200.0, 1),
        );

        assert_eq!(sink.len(), 2);
        let SampleValue::Points(points) = sink
            .get(
                EntityKind::Pod,
                "default/a",
                ResourceKind::Memory,
                SampleKind::Used,
            )
            .unwrap()
        else {
            panic!("expected point series");
        };
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 100.0);
    }

    #[test]
    fn concurrent_writers_are_safe() {
        use std::sync::Arc;

        let sink = Arc::new(EntityMetricSink::new().with_max_metric_points(64));
        let mut handles = Vec::new();
        for w in 0..8 {
            let sink = Arc::clone(&sink);
            handles.push(std::thread::spawn(move || {
                for i in 0..64 {
                    sink.add(
                        EntityKind::Node,
                        &format!("node{w}"),
                        ResourceKind::CpuMillicore,
                        SampleKind::Used,
                        SampleValue::point(i as f64, i),
                    );
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        for w in 0..8 {
            let SampleValue::Points(points) = sink
                .get(
                    EntityKind::Node,
                    &format!("node{w}"),
                    ResourceKind::CpuMillicore,
                    SampleKind::Used,
                )
                .unwrap()
            else {
                panic!("expected point series");
            };
            assert_eq!(points.len(), 64);
        }
    }
}
