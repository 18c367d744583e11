//! The in-memory topology built by the indexer. A snapshot is immutable
//! once a discovery cycle has produced it; downstream consumers only
//! read it.

use std::collections::HashMap;

use crate::metrics::types::container_metric_id;
use crate::metrics::types::pod_metric_id;

#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    /// Stable cluster identifier (the kube-system namespace UID).
    pub cluster_id: String,
    pub cluster_name: String,
    pub nodes: Vec<NodeInfo>,
    pub pods: Vec<PodInfo>,
    pub controllers: Vec<ControllerInfo>,
    pub namespaces: Vec<NamespaceInfo>,
}

impl TopologySnapshot {
    pub fn node(&self, name: &str) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn controller_by_uid(&self, uid: &str) -> Option<&ControllerInfo> {
        self.controllers.iter().find(|c| c.uid == uid)
    }

    /// Pods grouped by hosting node name.
    pub fn pods_by_node(&self) -> HashMap<&str, Vec<&PodInfo>> {
        let mut map: HashMap<&str, Vec<&PodInfo>> = HashMap::new();
        for pod in &self.pods {
            if let Some(node) = pod.node_name.as_deref() {
                map.entry(node).or_default().push(pod);
            }
        }
        map
    }
}

#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub name: String,
    pub uid: String,
    /// The machine UUID reported by the kubelet, used for VM stitching.
    pub system_uuid: String,
    pub provider_id: Option<String>,
    pub ip_addresses: Vec<String>,
    pub ready: bool,
    pub allocatable_cpu_milli: f64,
    pub allocatable_memory_kib: f64,
    pub allocatable_pods: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub node_name: Option<String>,
    pub phase: Option<String>,
    pub has_volumes: bool,
    /// The top-level workload controller owning this pod, if any.
    pub controller: Option<ControllerRef>,
    pub containers: Vec<ContainerInfo>,
}

impl PodInfo {
    pub fn metric_id(&self) -> String {
        pod_metric_id(&self.namespace, &self.name)
    }

    pub fn container_metric_id(&self, container_name: &str) -> String {
        container_metric_id(&self.metric_id(), container_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerRef {
    pub kind: String,
    pub name: String,
    pub uid: String,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub name: String,
    pub request_cpu_milli: Option<f64>,
    pub request_memory_kib: Option<f64>,
    pub limit_cpu_milli: Option<f64>,
    pub limit_memory_kib: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ControllerInfo {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub replicas: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct NamespaceInfo {
    pub name: String,
    pub uid: String,
    pub quota_cpu_limit_milli: Option<f64>,
    pub quota_memory_limit_kib: Option<f64>,
}
