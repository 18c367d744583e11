use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::aggregation;
use crate::aggregation::UsageDataStrategy;
use crate::aggregation::UtilizationDataStrategy;
use crate::discovery::DiscoveryConfig;
use crate::kubelet::KubeletClientConfig;

pub const MAX_DISCOVERY_SAMPLES: usize = 60;
pub const MIN_SAMPLE_INTERVAL_SEC: u64 = 10;

#[derive(Parser, Clone, Debug)]
#[command(name = "kubetrader", about = "Kubernetes cluster agent for the resource market")]
pub struct DaemonArgs {
    #[arg(long, default_value = "10265", help = "The port the agent's http service runs on")]
    pub port: u16,

    #[arg(long, default_value = "127.0.0.1", help = "The ip address the agent's http service runs on")]
    pub ip: String,

    #[arg(
        long,
        help = "The address of the Kubernetes API server (overrides any value in kubeconfig)"
    )]
    pub master: Option<String>,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file with authorization and master location information"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, help = "Path to the market connection config file")]
    pub turboconfig: Option<PathBuf>,

    #[arg(long, help = "Path to the testing flag file")]
    pub testingflag: Option<PathBuf>,

    #[arg(long, default_value_t = false, help = "Enable profiling endpoints on the admin server")]
    pub profiling: bool,

    #[arg(
        long = "stitch-uuid",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Use the VM UUID to stitch nodes, otherwise IP is used"
    )]
    pub stitch_uuid: bool,

    #[arg(long = "kubelet-port", default_value = "10255", help = "The port the kubelet runs on")]
    pub kubelet_port: u16,

    #[arg(
        long = "kubelet-https",
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Indicate if kubelet is running on an https server"
    )]
    pub kubelet_https: bool,

    #[arg(
        long = "use-node-proxy-endpoint",
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Route kubelet queries through the API server node proxy endpoint"
    )]
    pub use_node_proxy_endpoint: bool,

    #[arg(
        long = "kubelet-force-selfsigned-cert",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Accept the kubelet's self-signed certificate"
    )]
    pub kubelet_force_selfsigned_cert: bool,

    #[arg(
        long = "fail-volume-pod-moves",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Fail move actions for pods with attached volumes"
    )]
    pub fail_volume_pod_moves: bool,

    #[arg(
        long = "discovery-interval-sec",
        default_value = "600",
        help = "The full discovery interval in seconds"
    )]
    pub discovery_interval_sec: u64,

    #[arg(long = "validation-workers", default_value = "10", help = "The number of validation workers")]
    pub validation_workers: usize,

    #[arg(
        long = "validation-timeout-sec",
        default_value = "60",
        help = "The validation timeout in seconds"
    )]
    pub validation_timeout_sec: u64,

    #[arg(long = "discovery-workers", default_value = "4", help = "The number of discovery workers")]
    pub discovery_workers: usize,

    #[arg(
        long = "discovery-timeout-sec",
        default_value = "180",
        help = "The discovery timeout in seconds for each discovery worker"
    )]
    pub discovery_timeout_sec: u64,

    #[arg(
        long = "discovery-samples",
        default_value = "10",
        help = "The number of resource usage samples collected from the kubelet per full \
                discovery cycle; no larger than 60"
    )]
    pub discovery_samples: usize,

    #[arg(
        long = "discovery-sample-interval",
        default_value = "60",
        help = "The interval in seconds between resource usage samples; no smaller than 10"
    )]
    pub discovery_sample_interval_sec: u64,

    #[arg(
        long = "scc-support",
        value_delimiter = ',',
        default_value = "restricted",
        help = "The SCC list allowed for executing pod actions, e.g. restricted,anyuid or * \
                to allow all"
    )]
    pub scc_support: Vec<String>,

    #[arg(
        long = "cluster-api-namespace",
        default_value = "default",
        help = "The Cluster API namespace"
    )]
    pub cluster_api_namespace: String,

    #[arg(
        long = "busybox-image",
        default_value = "busybox",
        help = "The image used for the fallback node cpu frequency getter job"
    )]
    pub busybox_image: String,

    #[arg(
        long = "cnt-utilization-data-agg-strategy",
        default_value = aggregation::DEFAULT_UTILIZATION_DATA_AGG_STRATEGY,
        help = "Container utilization data aggregation strategy"
    )]
    pub cnt_utilization_data_agg_strategy: String,

    #[arg(
        long = "cnt-usage-data-agg-strategy",
        default_value = aggregation::DEFAULT_USAGE_DATA_AGG_STRATEGY,
        help = "Container usage data aggregation strategy"
    )]
    pub cnt_usage_data_agg_strategy: String,

    #[arg(
        long = "kubefed-namespace",
        help = "The federation control plane namespace; unset disables cross-cluster actions"
    )]
    pub kubefed_namespace: Option<String>,

    #[arg(
        long = "cluster-name",
        default_value = "kubernetes",
        help = "This cluster's name as registered with the federation control plane"
    )]
    pub cluster_name: String,
}

impl DaemonArgs {
    /// Rejects malformed flags the way the flag layer contract demands;
    /// out-of-range sampling knobs are clamped with a warning.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        self.ip
            .parse::<IpAddr>()
            .map_err(|_| anyhow::anyhow!("wrong ip format: {}", self.ip))?;
        if self.port == 0 {
            anyhow::bail!("port should be bigger than 0");
        }
        if self.kubelet_port == 0 {
            anyhow::bail!("kubelet port should be bigger than 0");
        }
        UtilizationDataStrategy::from_name(&self.cnt_utilization_data_agg_strategy)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        UsageDataStrategy::from_name(&self.cnt_usage_data_agg_strategy)
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        if self.discovery_samples > MAX_DISCOVERY_SAMPLES {
            tracing::warn!(
                "discovery-samples {} exceeds the maximum, clamping to {MAX_DISCOVERY_SAMPLES}",
                self.discovery_samples
            );
            self.discovery_samples = MAX_DISCOVERY_SAMPLES;
        }
        if self.discovery_sample_interval_sec < MIN_SAMPLE_INTERVAL_SEC {
            tracing::warn!(
                "discovery-sample-interval {} below the minimum, raising to {MIN_SAMPLE_INTERVAL_SEC}",
                self.discovery_sample_interval_sec
            );
            self.discovery_sample_interval_sec = MIN_SAMPLE_INTERVAL_SEC;
        }
        Ok(())
    }

    pub fn admin_listen_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn kubelet_client_config(&self) -> KubeletClientConfig {
        KubeletClientConfig {
            port: self.kubelet_port,
            https: self.kubelet_https,
            force_self_signed_certs: self.kubelet_force_selfsigned_cert,
            use_node_proxy_endpoint: self.use_node_proxy_endpoint,
        }
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            discovery_interval: Duration::from_secs(self.discovery_interval_sec),
            discovery_timeout: Duration::from_secs(self.discovery_timeout_sec),
            discovery_workers: self.discovery_workers,
            discovery_samples: self.discovery_samples,
            discovery_sample_interval: Duration::from_secs(self.discovery_sample_interval_sec),
            validation_workers: self.validation_workers,
            validation_timeout: Duration::from_secs(self.validation_timeout_sec),
            utilization_strategy: UtilizationDataStrategy::from_name(
                &self.cnt_utilization_data_agg_strategy,
            )
            .expect("validated at startup"),
            usage_strategy: UsageDataStrategy::from_name(&self.cnt_usage_data_agg_strategy)
                .expect("validated at startup"),
            stitch_with_uuid: self.stitch_uuid,
        }
    }
}
