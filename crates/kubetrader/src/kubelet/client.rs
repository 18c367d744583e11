//! HTTP client for the kubelet stats endpoints.
//!
//! Talks to the kubelet either directly (http/https, optionally
//! accepting self-signed certificates) or through the API-server
//! node-proxy endpoint. The last good summary per node is cached and
//! served when a fetch fails, with the node flagged so the DTO layer can
//! mark it stale.

use core::error::Error;
use std::time::Duration;

use dashmap::DashMap;
use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;

use super::cpufreq::CpuFreqJob;
use super::stats::MachineInfo;
use super::stats::Summary;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Display)]
pub enum KubeletError {
    #[display("failed to build kubelet http client: {message}")]
    ClientBuild { message: String },
    #[display("node {node} has no usable address")]
    AddressMissing { node: String },
    #[display("kubelet request to {node} failed: {message}")]
    RequestFailed { node: String, message: String },
    #[display("cpu frequency unavailable for node {node}")]
    CpuFrequencyUnavailable { node: String },
}

impl Error for KubeletError {}

#[derive(Debug, Clone)]
pub struct KubeletClientConfig {
    pub port: u16,
    pub https: bool,
    pub force_self_signed_certs: bool,
    pub use_node_proxy_endpoint: bool,
}

impl Default for KubeletClientConfig {
    fn default() -> Self {
        Self {
            port: 10255,
            https: false,
            force_self_signed_certs: true,
            use_node_proxy_endpoint: false,
        }
    }
}

pub struct KubeletClient {
    http: reqwest::Client,
    kube: kube::Client,
    config: KubeletClientConfig,
    cpufreq_fallback: Option<CpuFreqJob>,
    summary_cache: DashMap<String, Summary>,
    cache_used: DashMap<String, bool>,
    freq_cache: DashMap<String, f64>,
}

impl KubeletClient {
    pub fn new(
        kube: kube::Client,
        config: KubeletClientConfig,
        cpufreq_fallback: Option<CpuFreqJob>,
    ) -> Result<Self, Report<KubeletError>> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(config.force_self_signed_certs)
            .build()
            .map_err(|e| {
                Report::new(KubeletError::ClientBuild {
                    message: e.to_string(),
                })
            })?;

        Ok(Self {
            http,
            kube,
            config,
            cpufreq_fallback,
            summary_cache: DashMap::new(),
            cache_used: DashMap::new(),
            freq_cache: DashMap::new(),
        })
    }

    /// Fetches the stats summary for the node, falling back to the last
    /// cached summary when the kubelet is unreachable.
    pub async fn summary(&self, node: &Node) -> Result<Summary, Report<KubeletError>> {
        let name = node_name(node);

        match self.fetch::<Summary>(node, "stats/summary").await {
            Ok(summary) => {
                self.summary_cache.insert(name.clone(), summary.clone());
                self.cache_used.insert(name, false);
                Ok(summary)
            }
            Err(err) => match self.summary_cache.get(&name) {
                Some(cached) => {
                    tracing::warn!(node = %name, "serving cached kubelet summary: {err:?}");
                    let summary = cached.value().clone();
                    drop(cached);
                    self.cache_used.insert(name, true);
                    Ok(summary)
                }
                None => Err(err),
            },
        }
    }

    /// Whether the last `summary` call for the node was served from the
    /// stale cache.
    pub fn cache_used(&self, node: &Node) -> bool {
        self.cache_used
            .get(&node_name(node))
            .map(|v| *v)
            .unwrap_or(false)
    }

    /// Returns the node CPU frequency in MHz. The kubelet `/spec/`
    /// endpoint is tried first; when it cannot provide the frequency a
    /// one-shot job on the node greps `/proc/cpuinfo`. Frequencies are
    /// cached for the process lifetime.
    pub async fn cpu_frequency_mhz(&self, node: &Node) -> Result<f64, Report<KubeletError>> {
        let name = node_name(node);
        if let Some(freq) = self.freq_cache.get(&name) {
            return Ok(*freq);
        }

        let freq = match self.fetch::<MachineInfo>(node, "spec/").await {
            Ok(info) if info.cpu_frequency_khz > 0 => info.cpu_frequency_khz as f64 / 1000.0,
            Ok(_) | Err(_) => match &self.cpufreq_fallback {
                Some(job) => job.node_frequency_mhz(&name).await.change_context(
                    KubeletError::CpuFrequencyUnavailable { node: name.clone() },
                )?,
                None => {
                    return Err(Report::new(KubeletError::CpuFrequencyUnavailable {
                        node: name,
                    }))
                }
            },
        };

        self.freq_cache.insert(name, freq);
        Ok(freq)
    }

    async fn fetch<T: serde::de::DeserializeOwned>(
        &self,
        node: &Node,
        path: &str,
    ) -> Result<T, Report<KubeletError>> {
        if self.config.use_node_proxy_endpoint {
            self.fetch_via_proxy(node, path).await
        } else {
            self.fetch_direct(node, path).await
        }
    }

    async fn fetch_direct<T: serde::de::DeserializeOwned>(
        &self,
        node: &Node,
        path: &str,
    ) -> Result<T, Report<KubeletError>> {
        let name = node_name(node);
        let address = node_address(node).ok_or_else(|| {
            Report::new(KubeletError::AddressMissing { node: name.clone() })
        })?;
        let scheme = if self.config.https { "https" } else { "http" };
        let url = format!("{scheme}://{address}:{}/{path}", self.config.port);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                Report::new(KubeletError::RequestFailed {
                    node: name.clone(),
                    message: e.to_string(),
                })
            })?;

        response.json::<T>().await.map_err(|e| {
            Report::new(KubeletError::RequestFailed {
                node: name,
                message: format!("decoding response from {url}: {e}"),
            })
        })
    }

    async fn fetch_via_proxy<T: serde::de::DeserializeOwned>(
        &self,
        node: &Node,
        path: &str,
    ) -> Result<T, Report<KubeletError>> {
        let name = node_name(node);
        let uri = format!("/api/v1/nodes/{name}/proxy/{path}");
        let request = http::Request::builder()
            .uri(uri)
            .body(Vec::new())
            .map_err(|e| {
                Report::new(KubeletError::RequestFailed {
                    node: name.clone(),
                    message: e.to_string(),
                })
            })?;

        self.kube.request::<T>(request).await.map_err(|e| {
            Report::new(KubeletError::RequestFailed {
                node: name,
                message: format!("node proxy request failed: {e}"),
            })
        })
    }
}

pub(crate) fn node_name(node: &Node) -> String {
    node.metadata.name.clone().unwrap_or_default()
}

/// Picks the address to scrape: InternalIP preferred, ExternalIP as the
/// fallback.
pub(crate) fn node_address(node: &Node) -> Option<String> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    for wanted in ["InternalIP", "ExternalIP"] {
        if let Some(addr) = addresses.iter().find(|a| a.type_ == wanted) {
            return Some(addr.address.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::NodeAddress;
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn node_with_addresses(addresses: Vec<NodeAddress>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node1".to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(addresses),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn internal_ip_is_preferred() {
        let node = node_with_addresses(vec![
            NodeAddress {
                address: "203.0.113.7".to_string(),
                type_: "ExternalIP".to_string(),
            },
            NodeAddress {
                address: "10.0.0.7".to_string(),
                type_: "InternalIP".to_string(),
            },
        ]);
        assert_eq!(node_address(&node).as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn external_ip_is_the_fallback() {
        let node = node_with_addresses(vec![NodeAddress {
            address: "203.0.113.7".to_string(),
            type_: "ExternalIP".to_string(),
        }]);
        assert_eq!(node_address(&node).as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn hostname_only_node_has_no_scrape_address() {
        let node = node_with_addresses(vec![NodeAddress {
            address: "node1.cluster.local".to_string(),
            type_: "Hostname".to_string(),
        }]);
        assert_eq!(node_address(&node), None);
    }
}
