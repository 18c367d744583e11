//! Application assembly: clients, services and the executor registry.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::actions::MoveExecutor;
use crate::actions::NodeResolver;
use crate::actions::ResizeExecutor;
use crate::actions::ScaleDirection;
use crate::actions::ScaleExecutor;
use crate::actions::ActionType;
use crate::actions::ExecutorRegistry;
use crate::actions::SccAllowSet;
use crate::cluster::init_kube_client;
use crate::cluster::ClusterIndexer;
use crate::cluster::ControllerGroupVersions;
use crate::config::DaemonArgs;
use crate::discovery::DiscoveryOrchestrator;
use crate::discovery::DiscoveryStatus;
use crate::federation::FederationClient;
use crate::kubelet::CpuFreqJob;
use crate::kubelet::KubeletClient;
use crate::kubelet::NodeScraper;
use crate::market::LoggingTransport;
use crate::market::MarketTransport;
use crate::metrics::EntityKind;
use crate::scc;
use crate::scc::SccManager;

pub struct Services {
    pub orchestrator: Arc<DiscoveryOrchestrator>,
    pub registry: Arc<ExecutorRegistry>,
    pub transport: Arc<dyn MarketTransport>,
    pub scc_manager: Arc<SccManager>,
    pub discovery_status: Arc<DiscoveryStatus>,
}

pub struct Application {
    args: DaemonArgs,
    services: Services,
}

impl Application {
    /// Builds all clients and services. Failure here is fatal; the
    /// process exits non-zero.
    pub async fn build(mut args: DaemonArgs) -> anyhow::Result<Self> {
        args.validate()?;

        let client = build_kube_client(&args).await?;
        let groups = ControllerGroupVersions::discover(&client).await;
        info!(?groups, "controller group/versions selected");

        let agent_namespace = scc::agent_namespace();

        let cpufreq_fallback = CpuFreqJob::new(
            client.clone(),
            agent_namespace.clone(),
            args.busybox_image.clone(),
        );
        let kubelet = Arc::new(
            KubeletClient::new(
                client.clone(),
                args.kubelet_client_config(),
                Some(cpufreq_fallback),
            )
            .map_err(|e| anyhow::anyhow!("failed to build kubelet client: {e:?}"))?,
        );
        let scraper = Arc::new(NodeScraper::new(kubelet));

        let indexer = ClusterIndexer::new(client.clone(), args.cluster_name.clone());
        let transport: Arc<dyn MarketTransport> = Arc::new(LoggingTransport);
        let orchestrator = Arc::new(DiscoveryOrchestrator::new(
            indexer,
            scraper,
            Arc::clone(&transport),
            args.discovery_config(),
        ));
        let discovery_status = orchestrator.status();

        let federation = args.kubefed_namespace.clone().map(|namespace| {
            Arc::new(FederationClient::new(
                client.clone(),
                namespace,
                args.cluster_name.clone(),
            ))
        });

        let resolver = NodeResolver::new(client.clone(), federation.clone());
        let scc_allowed = SccAllowSet::from_list(&args.scc_support);

        let mut registry = ExecutorRegistry::new();
        registry.register(
            ActionType::Move,
            EntityKind::Pod,
            Arc::new(MoveExecutor::new(
                client.clone(),
                resolver,
                federation,
                scc_allowed,
                args.fail_volume_pod_moves,
            )),
        );
        registry.register(
            ActionType::Resize,
            EntityKind::Container,
            Arc::new(ResizeExecutor::new(client.clone(), groups.clone())),
        );
        registry.register(
            ActionType::Provision,
            EntityKind::WorkloadController,
            Arc::new(ScaleExecutor::new(
                client.clone(),
                groups.clone(),
                ScaleDirection::Up,
            )),
        );
        registry.register(
            ActionType::Suspend,
            EntityKind::WorkloadController,
            Arc::new(ScaleExecutor::new(client.clone(), groups, ScaleDirection::Down)),
        );

        let scc_manager = Arc::new(SccManager::new(client, agent_namespace));

        Ok(Self {
            args,
            services: Services {
                orchestrator,
                registry: Arc::new(registry),
                transport,
                scc_manager,
                discovery_status,
            },
        })
    }

    pub fn args(&self) -> &DaemonArgs {
        &self.args
    }

    pub fn services(&self) -> &Services {
        &self.services
    }
}

async fn build_kube_client(args: &DaemonArgs) -> anyhow::Result<kube::Client> {
    if let Some(master) = &args.master {
        let uri = master
            .parse()
            .with_context(|| format!("malformed master url {master}"))?;
        let config = kube::Config::new(uri);
        return kube::Client::try_from(config).context("building client for master url");
    }
    init_kube_client(args.kubeconfig.clone())
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))
}
