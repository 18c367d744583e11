//! Per-node scrape worker: pulls CPU frequency and the stats summary
//! from the kubelet, normalizes units and emits samples into the cycle's
//! metric sink.

use std::sync::Arc;

use error_stack::Report;
use k8s_openapi::api::core::v1::Node;
use tracing::debug;

use super::client::KubeletClient;
use super::client::KubeletError;
use super::stats::bytes_to_kib;
use super::stats::bytes_to_mib;
use super::stats::nano_to_milli;
use super::stats::PodStats;
use super::stats::Summary;
use crate::metrics::types::application_metric_id;
use crate::metrics::types::container_metric_id;
use crate::metrics::types::pod_metric_id;
use crate::metrics::types::NODE_CACHE_USED;
use crate::metrics::EntityKind;
use crate::metrics::EntityMetricSink;
use crate::metrics::ResourceKind;
use crate::metrics::SampleKind;
use crate::metrics::SampleValue;

pub struct NodeScraper {
    kubelet: Arc<KubeletClient>,
}

impl NodeScraper {
    pub fn new(kubelet: Arc<KubeletClient>) -> Self {
        Self { kubelet }
    }

    /// Scrapes one node for one sampling sub-cycle. A failure drops this
    /// node's samples for the sub-cycle; the caller logs and moves on.
    pub async fn scrape(
        &self,
        node: &Node,
        sink: &EntityMetricSink,
    ) -> Result<(), Report<KubeletError>> {
        let name = node.metadata.name.clone().unwrap_or_default();

        let frequency_mhz = self.kubelet.cpu_frequency_mhz(node).await?;
        let summary = self.kubelet.summary(node).await?;
        let cache_used = self.kubelet.cache_used(node);

        let timestamp = chrono::Utc::now().timestamp_millis();
        record_summary(sink, &name, frequency_mhz, &summary, cache_used, timestamp);

        debug!(node = %name, "finished scraping node");
        Ok(())
    }
}

/// Writes one sub-cycle worth of samples for a node into the sink.
pub fn record_summary(
    sink: &EntityMetricSink,
    node_name: &str,
    frequency_mhz: f64,
    summary: &Summary,
    cache_used: bool,
    timestamp: i64,
) {
    sink.add(
        EntityKind::Node,
        node_name,
        ResourceKind::CpuFrequency,
        SampleKind::Used,
        SampleValue::Scalar(frequency_mhz),
    );

    if cache_used {
        // Health marker: the kubelet served stale cached stats.
        sink.set_state(EntityKind::Node, node_name, NODE_CACHE_USED, 1.0);
    }

    record_node_stats(sink, node_name, summary, timestamp);
    for pod in &summary.pods {
        record_pod_stats(sink, pod, timestamp);
    }
}

fn record_node_stats(sink: &EntityMetricSink, node_name: &str, summary: &Summary, timestamp: i64) {
    let stats = &summary.node;

    if let Some(nano) = stats.cpu.as_ref().and_then(|c| c.usage_nano_cores) {
        sink.add(
            EntityKind::Node,
            node_name,
            ResourceKind::CpuMillicore,
            SampleKind::Used,
            SampleValue::point(nano_to_milli(nano as f64), timestamp),
        );
    }
    if let Some(bytes) = stats.memory.as_ref().and_then(|m| m.working_set_bytes) {
        sink.add(
            EntityKind::Node,
            node_name,
            ResourceKind::Memory,
            SampleKind::Used,
            SampleValue::point(bytes_to_kib(bytes as f64), timestamp),
        );
    }
    if let Some(fs) = &stats.fs {
        if let Some(capacity) = fs.capacity_bytes {
            sink.add(
                EntityKind::Node,
                node_name,
                ResourceKind::VStorage,
                SampleKind::Capacity,
                SampleValue::Scalar(bytes_to_mib(capacity as f64)),
            );
        }
        if let Some(used) = fs.used_bytes {
            sink.add(
                EntityKind::Node,
                node_name,
                ResourceKind::VStorage,
                SampleKind::Used,
                SampleValue::point(bytes_to_mib(used as f64), timestamp),
            );
        }
    }
}

fn record_pod_stats(sink: &EntityMetricSink, pod: &PodStats, timestamp: i64) {
    let pod_id = pod_metric_id(&pod.pod_ref.namespace, &pod.pod_ref.name);

    let (pod_cpu_milli, pod_memory_kib) = record_container_stats(sink, pod, &pod_id, timestamp);

    sink.add(
        EntityKind::Pod,
        &pod_id,
        ResourceKind::CpuMillicore,
        SampleKind::Used,
        SampleValue::point(pod_cpu_milli, timestamp),
    );
    sink.add(
        EntityKind::Pod,
        &pod_id,
        ResourceKind::Memory,
        SampleKind::Used,
        SampleValue::point(pod_memory_kib, timestamp),
    );
    // Each pod consumes one slot of the node's allocatable pod count.
    sink.add(
        EntityKind::Pod,
        &pod_id,
        ResourceKind::NumPods,
        SampleKind::Used,
        SampleValue::Scalar(1.0),
    );

    if let Some(fs) = &pod.ephemeral_storage {
        if let Some(capacity) = fs.capacity_bytes {
            sink.add(
                EntityKind::Pod,
                &pod_id,
                ResourceKind::VStorage,
                SampleKind::Capacity,
                SampleValue::Scalar(bytes_to_mib(capacity as f64)),
            );
        }
        if let Some(used) = fs.used_bytes {
            sink.add(
                EntityKind::Pod,
                &pod_id,
                ResourceKind::VStorage,
                SampleKind::Used,
                SampleValue::point(bytes_to_mib(used as f64), timestamp),
            );
        }
    } else {
        debug!(pod = %pod_id, "ephemeral fs stats not available");
    }
}

/// Emits per-container and per-application samples and returns the
/// pod-level `(cpu millicores, memory KiB)` totals.
fn record_container_stats(
    sink: &EntityMetricSink,
    pod: &PodStats,
    pod_id: &str,
    timestamp: i64,
) -> (f64, f64) {
    let mut total_cpu = 0.0;
    let mut total_memory = 0.0;

    for container in &pod.containers {
        let Some(nano) = container.cpu.as_ref().and_then(|c| c.usage_nano_cores) else {
            continue;
        };
        let Some(bytes) = container.memory.as_ref().and_then(|m| m.working_set_bytes) else {
            continue;
        };

        let cpu_milli = nano_to_milli(nano as f64);
        let memory_kib = bytes_to_kib(bytes as f64);
        total_cpu += cpu_milli;
        total_memory += memory_kib;

        let container_id = container_metric_id(pod_id, &container.name);
        for (resource, value) in [
            (ResourceKind::CpuMillicore, cpu_milli),
            (ResourceKind::Memory, memory_kib),
            // Request commodities reuse the measured usage.
            (ResourceKind::CpuRequest, cpu_milli),
            (ResourceKind::MemoryRequest, memory_kib),
        ] {
            sink.add(
                EntityKind::Container,
                &container_id,
                resource,
                SampleKind::Used,
                SampleValue::point(value, timestamp),
            );
        }

        let app_id = application_metric_id(&container_id);
        for (resource, value) in [
            (ResourceKind::CpuMillicore, cpu_milli),
            (ResourceKind::Memory, memory_kib),
        ] {
            sink.add(
                EntityKind::Application,
                &app_id,
                resource,
                SampleKind::Used,
                SampleValue::point(value, timestamp),
            );
        }
    }

    (total_cpu, total_memory)
}

#[cfg(test)]
mod tests {
    use super::super::stats::ContainerStats;
    use super::super::stats::CpuStats;
    use super::super::stats::FsStats;
    use super::super::stats::MemoryStats;
    use super::super::stats::NodeStats;
    use super::super::stats::PodReference;
    use super::*;
    use crate::metrics::Point;

    fn sample_summary() -> Summary {
        Summary {
            node: NodeStats {
                node_name: "node1".to_string(),
                cpu: Some(CpuStats {
                    usage_nano_cores: Some(500_000_000),
                }),
                memory: Some(MemoryStats {
                    working_set_bytes: Some(4096),
                }),
                fs: Some(FsStats {
                    capacity_bytes: Some(10 * 1024 * 1024),
                    used_bytes: Some(2 * 1024 * 1024),
                }),
            },
            pods: vec![PodStats {
                pod_ref: PodReference {
                    name: "web-0".to_string(),
                    namespace: "default".to_string(),
                    uid: "uid-web-0".to_string(),
                },
                containers: vec![
                    ContainerStats {
                        name: "web".to_string(),
                        cpu: Some(CpuStats {
                            usage_nano_cores: Some(100_000_000),
                        }),
                        memory: Some(MemoryStats {
                            working_set_bytes: Some(2048),
                        }),
                    },
                    ContainerStats {
                        name: "sidecar".to_string(),
                        // Missing memory stats: the container is skipped.
                        cpu: Some(CpuStats {
                            usage_nano_cores: Some(50_000_000),
                        }),
                        memory: None,
                    },
                ],
                ephemeral_storage: None,
            }],
        }
    }

    fn points(sink: &EntityMetricSink, kind: EntityKind, key: &str, r: ResourceKind) -> Vec<Point> {
        match sink.get(kind, key, r, SampleKind::Used).unwrap() {
            SampleValue::Points(p) => p,
            other => panic!("expected points, got {other:?}"),
        }
    }

    #[test]
    fn node_samples_are_normalized() {
        let sink = EntityMetricSink::new();
        record_summary(&sink, "node1", 2400.0, &sample_summary(), false, 7);

        assert_eq!(
            sink.get(
                EntityKind::Node,
                "node1",
                ResourceKind::CpuFrequency,
                SampleKind::Used
            ),
            Some(SampleValue::Scalar(2400.0))
        );

        let cpu = points(&sink, EntityKind::Node, "node1", ResourceKind::CpuMillicore);
        assert_eq!(cpu, vec![Point { value: 500.0, timestamp: 7 }]);

        let mem = points(&sink, EntityKind::Node, "node1", ResourceKind::Memory);
        assert_eq!(mem[0].value, 4.0);

        assert_eq!(
            sink.get(
                EntityKind::Node,
                "node1",
                ResourceKind::VStorage,
                SampleKind::Capacity
            ),
            Some(SampleValue::Scalar(10.0))
        );
    }

    #[test]
    fn pod_totals_skip_incomplete_containers() {
        let sink = EntityMetricSink::new();
        record_summary(&sink, "node1", 2400.0, &sample_summary(), false, 7);

        // Only the "web" container has both cpu and memory stats.
        let cpu = points(&sink, EntityKind::Pod, "default/web-0", ResourceKind::CpuMillicore);
        assert_eq!(cpu[0].value, 100.0);

        assert!(sink
            .get(
                EntityKind::Container,
                "default/web-0/sidecar",
                ResourceKind::CpuMillicore,
                SampleKind::Used
            )
            .is_none());
    }

    #[test]
    fn container_usage_is_duplicated_into_requests() {
        let sink = EntityMetricSink::new();
        record_summary(&sink, "node1", 2400.0, &sample_summary(), false, 7);

        let used = points(
            &sink,
            EntityKind::Container,
            "default/web-0/web",
            ResourceKind::CpuMillicore,
        );
        let request_used = match sink
            .get(
                EntityKind::Container,
                "default/web-0/web",
                ResourceKind::CpuRequest,
                SampleKind::Used,
            )
            .unwrap()
        {
            SampleValue::Points(p) => p,
            other => panic!("expected points, got {other:?}"),
        };
        assert_eq!(used, request_used);
    }

    #[test]
    fn application_samples_mirror_container_usage() {
        let sink = EntityMetricSink::new();
        record_summary(&sink, "node1", 2400.0, &sample_summary(), false, 7);

        let app = points(
            &sink,
            EntityKind::Application,
            "App-default/web-0/web",
            ResourceKind::Memory,
        );
        assert_eq!(app[0].value, 2.0);
    }

    #[test]
    fn pod_consumes_one_numpods_slot() {
        let sink = EntityMetricSink::new();
        record_summary(&sink, "node1", 2400.0, &sample_summary(), false, 7);

        assert_eq!(
            sink.get(
                EntityKind::Pod,
                "default/web-0",
                ResourceKind::NumPods,
                SampleKind::Used
            ),
            Some(SampleValue::Scalar(1.0))
        );
    }

    #[test]
    fn cache_marker_is_recorded() {
        let sink = EntityMetricSink::new();
        record_summary(&sink, "node1", 2400.0, &sample_summary(), true, 7);

        assert_eq!(
            sink.state(EntityKind::Node, "node1", NODE_CACHE_USED),
            Some(1.0)
        );
        assert_eq!(sink.state(EntityKind::Node, "node2", NODE_CACHE_USED), None);
    }
}
