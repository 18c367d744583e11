//! Serde mirror of the kubelet `stats/v1alpha1` summary schema, plus the
//! `/spec/` machine info, reduced to the fields the scraper consumes.

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    #[serde(default)]
    pub node: NodeStats,
    #[serde(default)]
    pub pods: Vec<PodStats>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    #[serde(default)]
    pub node_name: String,
    pub cpu: Option<CpuStats>,
    pub memory: Option<MemoryStats>,
    pub fs: Option<FsStats>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStats {
    pub pod_ref: PodReference,
    #[serde(default)]
    pub containers: Vec<ContainerStats>,
    #[serde(rename = "ephemeral-storage")]
    pub ephemeral_storage: Option<FsStats>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodReference {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub name: String,
    pub cpu: Option<CpuStats>,
    pub memory: Option<MemoryStats>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub usage_nano_cores: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub working_set_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsStats {
    pub capacity_bytes: Option<u64>,
    pub used_bytes: Option<u64>,
}

/// The cadvisor machine info served by the kubelet `/spec/` endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MachineInfo {
    #[serde(default)]
    pub num_cores: u32,
    #[serde(default)]
    pub cpu_frequency_khz: u64,
    #[serde(default)]
    pub memory_capacity: u64,
}

/// nanocores to millicores.
pub fn nano_to_milli(v: f64) -> f64 {
    v / 1_000_000.0
}

/// bytes to binary kilobytes.
pub fn bytes_to_kib(v: f64) -> f64 {
    v / 1024.0
}

/// bytes to binary megabytes.
pub fn bytes_to_mib(v: f64) -> f64 {
    v / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_summary_subset() {
        let raw = r#"{
            "node": {
                "nodeName": "node1",
                "cpu": {"time": "2024-01-01T00:00:00Z", "usageNanoCores": 250000000},
                "memory": {"workingSetBytes": 2097152},
                "fs": {"capacityBytes": 10737418240, "usedBytes": 1073741824}
            },
            "pods": [{
                "podRef": {"name": "web-0", "namespace": "default", "uid": "abc"},
                "containers": [{
                    "name": "web",
                    "cpu": {"usageNanoCores": 100000000},
                    "memory": {"workingSetBytes": 1048576}
                }],
                "ephemeral-storage": {"capacityBytes": 5368709120, "usedBytes": 536870912}
            }]
        }"#;

        let summary: Summary = serde_json::from_str(raw).unwrap();
        assert_eq!(summary.node.node_name, "node1");
        assert_eq!(summary.node.cpu.unwrap().usage_nano_cores, Some(250000000));
        assert_eq!(summary.pods.len(), 1);

        let pod = &summary.pods[0];
        assert_eq!(pod.pod_ref.namespace, "default");
        assert_eq!(pod.containers[0].name, "web");
        assert_eq!(
            pod.ephemeral_storage.as_ref().unwrap().used_bytes,
            Some(536870912)
        );
    }

    #[test]
    fn parses_machine_info() {
        let raw = r#"{"num_cores": 8, "cpu_frequency_khz": 2400000, "memory_capacity": 16000000000}"#;
        let info: MachineInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.cpu_frequency_khz, 2400000);
    }

    #[test]
    fn unit_conversions() {
        assert_eq!(nano_to_milli(250_000_000.0), 250.0);
        assert_eq!(bytes_to_kib(2048.0), 2.0);
        assert_eq!(bytes_to_mib(3.0 * 1024.0 * 1024.0), 3.0);
    }
}
