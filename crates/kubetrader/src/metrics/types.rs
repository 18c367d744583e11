//! Sample model shared by the scraper, the sink and the aggregation
//! engine.

use serde::Deserialize;
use serde::Serialize;

/// The kinds of entities discovered from the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Cluster,
    Node,
    Pod,
    Container,
    ContainerSpec,
    Application,
    Namespace,
    WorkloadController,
    Volume,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Cluster => "Cluster",
            EntityKind::Node => "Node",
            EntityKind::Pod => "Pod",
            EntityKind::Container => "Container",
            EntityKind::ContainerSpec => "ContainerSpec",
            EntityKind::Application => "Application",
            EntityKind::Namespace => "Namespace",
            EntityKind::WorkloadController => "WorkloadController",
            EntityKind::Volume => "Volume",
        }
    }
}

/// Resource kinds tracked per entity. CPU family values are stored in
/// millicores and converted to MHz at DTO build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Cpu,
    CpuMillicore,
    Memory,
    MemoryRequest,
    CpuRequest,
    VcpuThrottling,
    VStorage,
    NumPods,
    CpuFrequency,
}

impl ResourceKind {
    /// CPU-family resources need a node frequency converter when built
    /// into commodities.
    pub fn is_cpu_family(&self) -> bool {
        matches!(
            self,
            ResourceKind::Cpu | ResourceKind::CpuMillicore | ResourceKind::CpuRequest
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleKind {
    Used,
    Capacity,
}

/// Name of the node state marker set when the kubelet served stale
/// cached stats.
pub const NODE_CACHE_USED: &str = "NodeCacheUsed";

/// A single timestamped measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub value: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// One sample of the cumulative CPU throttling counters. Both counters
/// are monotonically non-decreasing until the container restarts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThrottlingCumulative {
    pub throttled: f64,
    pub total: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// The value carried by a sample: a plain scalar, a point series, or a
/// cumulative throttling series.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    Scalar(f64),
    Points(Vec<Point>),
    Throttling(Vec<ThrottlingCumulative>),
}

impl SampleValue {
    pub fn point(value: f64, timestamp: i64) -> Self {
        SampleValue::Points(vec![Point { value, timestamp }])
    }

    pub fn throttling(throttled: f64, total: f64, timestamp: i64) -> Self {
        SampleValue::Throttling(vec![ThrottlingCumulative {
            throttled,
            total,
            timestamp,
        }])
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            SampleValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }
}

/// Builds the metric id of a pod, `namespace/name`.
pub fn pod_metric_id(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Builds the metric id of a container, `namespace/pod/container`.
pub fn container_metric_id(pod_metric_id: &str, container_name: &str) -> String {
    format!("{pod_metric_id}/{container_name}")
}

/// Builds the metric id of the application running in a container.
pub fn application_metric_id(container_metric_id: &str) -> String {
    format!("App-{container_metric_id}")
}

/// Builds the aggregate id shared by all replicas of one controller's
/// container definition.
pub fn container_spec_id(controller_uid: &str, container_name: &str) -> String {
    format!("{controller_uid}/{container_name}")
}
