//! Lists nodes, pods, namespaces, quotas and the workload controller set
//! through the cluster API and assembles the topology snapshot.

use core::error::Error;
use std::collections::BTreeMap;
use std::collections::HashMap;

use derive_more::Display;
use error_stack::Report;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::ReplicationController;
use k8s_openapi::api::core::v1::ResourceQuota;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ApiResource;
use kube::api::DynamicObject;
use kube::api::GroupVersionKind;
use kube::api::ListParams;
use kube::Api;
use kube::ResourceExt;
use tracing::debug;
use tracing::warn;

use super::groups::KIND_CRON_JOB;
use super::groups::KIND_DAEMON_SET;
use super::groups::KIND_DEPLOYMENT;
use super::groups::KIND_DEPLOYMENT_CONFIG;
use super::groups::KIND_JOB;
use super::groups::KIND_REPLICA_SET;
use super::groups::KIND_REPLICATION_CONTROLLER;
use super::groups::KIND_STATEFUL_SET;
use super::groups::OPENSHIFT_APPS_GROUP;
use super::quantity::quantity_to_kib;
use super::quantity::quantity_to_millicores;
use super::topology::ContainerInfo;
use super::topology::ControllerInfo;
use super::topology::ControllerRef;
use super::topology::NamespaceInfo;
use super::topology::NodeInfo;
use super::topology::PodInfo;
use super::topology::TopologySnapshot;

const SUPPORTED_CONTROLLER_KINDS: [&str; 8] = [
    KIND_CRON_JOB,
    KIND_DAEMON_SET,
    KIND_DEPLOYMENT,
    KIND_DEPLOYMENT_CONFIG,
    KIND_JOB,
    KIND_REPLICA_SET,
    KIND_REPLICATION_CONTROLLER,
    KIND_STATEFUL_SET,
];

const MAX_OWNER_CHAIN: usize = 8;

#[derive(Debug, Display)]
pub enum IndexError {
    #[display("failed to list {resource}: {message}")]
    ListFailed { resource: String, message: String },
}

impl Error for IndexError {}

/// An indexed controller together with its own controlling owner, used
/// to walk ownership chains (ReplicaSet -> Deployment, Job -> CronJob).
struct IndexedController {
    info: ControllerInfo,
    owner: Option<OwnerReference>,
}

/// The indexing result: the distilled snapshot plus the raw node
/// objects the scrapers need for endpoint resolution.
pub struct IndexedCluster {
    pub snapshot: TopologySnapshot,
    pub nodes: Vec<Node>,
}

pub struct ClusterIndexer {
    client: kube::Client,
    cluster_name: String,
}

impl ClusterIndexer {
    pub fn new(client: kube::Client, cluster_name: String) -> Self {
        Self {
            client,
            cluster_name,
        }
    }

    /// Builds the topology snapshot for one discovery cycle. Node or pod
    /// listing failures abort the cycle; individual controller kinds are
    /// skipped with a warning.
    pub async fn index(&self) -> Result<IndexedCluster, Report<IndexError>> {
        let nodes = self.list::<Node>("nodes").await?;
        let pods = self.list::<Pod>("pods").await?;

        let controllers = self.index_controllers().await;
        let namespaces = self.index_namespaces().await;

        let cluster_id = self.cluster_id().await;

        let pods = pods
            .iter()
            .map(|p| pod_info(p, &controllers))
            .collect::<Vec<_>>();

        let snapshot = TopologySnapshot {
            cluster_id,
            cluster_name: self.cluster_name.clone(),
            nodes: nodes.iter().map(node_info).collect(),
            pods,
            controllers: controllers.into_values().map(|c| c.info).collect(),
            namespaces,
        };

        debug!(
            nodes = snapshot.nodes.len(),
            pods = snapshot.pods.len(),
            controllers = snapshot.controllers.len(),
            "indexed cluster topology"
        );
        Ok(IndexedCluster { snapshot, nodes })
    }

    async fn list<K>(&self, resource: &str) -> Result<Vec<K>, Report<IndexError>>
    where
        K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::all(self.client.clone());
        api.list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| {
                Report::new(IndexError::ListFailed {
                    resource: resource.to_string(),
                    message: e.to_string(),
                })
            })
    }

    /// The kube-system namespace UID doubles as the stable cluster id.
    async fn cluster_id(&self) -> String {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.get("kube-system").await {
            Ok(ns) => ns.metadata.uid.unwrap_or_default(),
            Err(e) => {
                warn!("failed to read kube-system namespace for cluster id: {e}");
                String::new()
            }
        }
    }

    async fn index_controllers(&self) -> HashMap<String, IndexedController> {
        let mut controllers = HashMap::new();

        self.collect::<Deployment>(KIND_DEPLOYMENT, &mut controllers, |d| {
            d.spec.as_ref().and_then(|s| s.replicas)
        })
        .await;
        self.collect::<ReplicaSet>(KIND_REPLICA_SET, &mut controllers, |r| {
            r.spec.as_ref().and_then(|s| s.replicas)
        })
        .await;
        self.collect::<StatefulSet>(KIND_STATEFUL_SET, &mut controllers, |s| {
            s.spec.as_ref().and_then(|s| s.replicas)
        })
        .await;
        self.collect::<DaemonSet>(KIND_DAEMON_SET, &mut controllers, |_| None).await;
        self.collect::<Job>(KIND_JOB, &mut controllers, |_| None).await;
        self.collect::<CronJob>(KIND_CRON_JOB, &mut controllers, |_| None).await;
        self.collect::<ReplicationController>(
            KIND_REPLICATION_CONTROLLER,
            &mut controllers,
            |r| r.spec.as_ref().and_then(|s| s.replicas),
        )
        .await;

        self.collect_deployment_configs(&mut controllers).await;

        controllers
    }

    async fn collect<K>(
        &self,
        kind: &str,
        controllers: &mut HashMap<String, IndexedController>,
        replicas: impl Fn(&K) -> Option<i32>,
    ) where
        K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let items = match api.list(&ListParams::default()).await {
            Ok(list) => list.items,
            Err(e) => {
                warn!(kind, "skipping controller kind, list failed: {e}");
                return;
            }
        };

        for item in items {
            let uid = item.uid().unwrap_or_default();
            if uid.is_empty() {
                continue;
            }
            let owner = controlling_owner(Some(item.owner_references()));
            controllers.insert(
                uid.clone(),
                IndexedController {
                    info: ControllerInfo {
                        kind: kind.to_string(),
                        name: item.name_any(),
                        namespace: item.namespace().unwrap_or_default(),
                        uid,
                        replicas: replicas(&item),
                    },
                    owner,
                },
            );
        }
    }

    /// OpenShift DeploymentConfigs are fetched through the dynamic API;
    /// absence of the resource just means a vanilla cluster.
    async fn collect_deployment_configs(
        &self,
        controllers: &mut HashMap<String, IndexedController>,
    ) {
        let gvk = GroupVersionKind::gvk(OPENSHIFT_APPS_GROUP, "v1", KIND_DEPLOYMENT_CONFIG);
        let ar = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);

        let items = match api.list(&ListParams::default()).await {
            Ok(list) => list.items,
            Err(e) => {
                debug!("deploymentconfigs not available: {e}");
                return;
            }
        };

        for item in items {
            let uid = item.uid().unwrap_or_default();
            if uid.is_empty() {
                continue;
            }
            let replicas = item
                .data
                .get("spec")
                .and_then(|s| s.get("replicas"))
                .and_then(|r| r.as_i64())
                .map(|r| r as i32);
            controllers.insert(
                uid.clone(),
                IndexedController {
                    info: ControllerInfo {
                        kind: KIND_DEPLOYMENT_CONFIG.to_string(),
                        name: item.name_any(),
                        namespace: item.namespace().unwrap_or_default(),
                        uid,
                        replicas,
                    },
                    owner: controlling_owner(item.metadata.owner_references.as_deref()),
                },
            );
        }
    }

    async fn index_namespaces(&self) -> Vec<NamespaceInfo> {
        let namespaces = match self.list::<Namespace>("namespaces").await {
            Ok(items) => items,
            Err(e) => {
                warn!("skipping namespace indexing: {e:?}");
                return Vec::new();
            }
        };
        let quotas = match self.list::<ResourceQuota>("resourcequotas").await {
            Ok(items) => items,
            Err(e) => {
                warn!("skipping quota indexing: {e:?}");
                Vec::new()
            }
        };

        namespaces
            .into_iter()
            .map(|ns| {
                let name = ns.metadata.name.unwrap_or_default();
                let (cpu, memory) = namespace_quota_limits(&name, &quotas);
                NamespaceInfo {
                    uid: ns.metadata.uid.unwrap_or_default(),
                    name,
                    quota_cpu_limit_milli: cpu,
                    quota_memory_limit_kib: memory,
                }
            })
            .collect()
    }
}

/// The tightest CPU/memory limits across all quotas in a namespace.
fn namespace_quota_limits(
    namespace: &str,
    quotas: &[ResourceQuota],
) -> (Option<f64>, Option<f64>) {
    let mut cpu: Option<f64> = None;
    let mut memory: Option<f64> = None;

    for quota in quotas {
        if quota.metadata.namespace.as_deref() != Some(namespace) {
            continue;
        }
        let hard = quota
            .status
            .as_ref()
            .and_then(|s| s.hard.as_ref())
            .or_else(|| quota.spec.as_ref().and_then(|s| s.hard.as_ref()));
        let Some(hard) = hard else { continue };

        if let Some(v) = hard.get("limits.cpu").and_then(quantity_to_millicores) {
            cpu = Some(cpu.map_or(v, |c: f64| c.min(v)));
        }
        if let Some(v) = hard.get("limits.memory").and_then(quantity_to_kib) {
            memory = Some(memory.map_or(v, |m: f64| m.min(v)));
        }
    }
    (cpu, memory)
}

fn node_info(node: &Node) -> NodeInfo {
    let status = node.status.as_ref();
    let allocatable = status.and_then(|s| s.allocatable.as_ref());

    let ip_addresses = status
        .and_then(|s| s.addresses.as_ref())
        .map(|addresses| {
            addresses
                .iter()
                .filter(|a| a.type_ == "InternalIP" || a.type_ == "ExternalIP")
                .map(|a| a.address.clone())
                .collect()
        })
        .unwrap_or_default();

    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);

    NodeInfo {
        name: node.metadata.name.clone().unwrap_or_default(),
        uid: node.metadata.uid.clone().unwrap_or_default(),
        system_uuid: status
            .map(|s| s.node_info.as_ref().map(|i| i.system_uuid.clone()))
            .flatten()
            .unwrap_or_default(),
        provider_id: node.spec.as_ref().and_then(|s| s.provider_id.clone()),
        ip_addresses,
        ready,
        allocatable_cpu_milli: lookup_quantity(allocatable, "cpu", quantity_to_millicores),
        allocatable_memory_kib: lookup_quantity(allocatable, "memory", quantity_to_kib),
        allocatable_pods: lookup_quantity(allocatable, "pods", |q| {
            super::quantity::parse_quantity(q)
        }),
    }
}

fn lookup_quantity(
    map: Option<&BTreeMap<String, Quantity>>,
    key: &str,
    convert: impl Fn(&Quantity) -> Option<f64>,
) -> f64 {
    map.and_then(|m| m.get(key)).and_then(convert).unwrap_or(0.0)
}

fn pod_info(pod: &Pod, controllers: &HashMap<String, IndexedController>) -> PodInfo {
    let spec = pod.spec.as_ref();

    let containers = spec
        .map(|s| {
            s.containers
                .iter()
                .map(|c| {
                    let resources = c.resources.as_ref();
                    let requests = resources.and_then(|r| r.requests.as_ref());
                    let limits = resources.and_then(|r| r.limits.as_ref());
                    ContainerInfo {
                        name: c.name.clone(),
                        request_cpu_milli: requests
                            .and_then(|r| r.get("cpu"))
                            .and_then(quantity_to_millicores),
                        request_memory_kib: requests
                            .and_then(|r| r.get("memory"))
                            .and_then(quantity_to_kib),
                        limit_cpu_milli: limits
                            .and_then(|r| r.get("cpu"))
                            .and_then(quantity_to_millicores),
                        limit_memory_kib: limits
                            .and_then(|r| r.get("memory"))
                            .and_then(quantity_to_kib),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let has_volumes = spec
        .and_then(|s| s.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .any(|v| v.persistent_volume_claim.is_some())
        })
        .unwrap_or(false);

    PodInfo {
        name: pod.metadata.name.clone().unwrap_or_default(),
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        uid: pod.metadata.uid.clone().unwrap_or_default(),
        node_name: spec.and_then(|s| s.node_name.clone()),
        phase: pod.status.as_ref().and_then(|s| s.phase.clone()),
        has_volumes,
        controller: resolve_top_owner(pod.metadata.owner_references.as_deref(), controllers),
        containers,
    }
}

fn controlling_owner(owner_refs: Option<&[OwnerReference]>) -> Option<OwnerReference> {
    owner_refs?
        .iter()
        .find(|r| r.controller == Some(true))
        .cloned()
}

/// Walks `ownerReferences` to the top-level workload controller. A pod
/// owned by a ReplicaSet that is itself owned by a Deployment resolves
/// to the Deployment; unresolved pods are bare pods.
fn resolve_top_owner(
    owner_refs: Option<&[OwnerReference]>,
    controllers: &HashMap<String, IndexedController>,
) -> Option<ControllerRef> {
    let mut current = controlling_owner(owner_refs)?;
    if !SUPPORTED_CONTROLLER_KINDS.contains(&current.kind.as_str()) {
        return None;
    }

    for _ in 0..MAX_OWNER_CHAIN {
        let Some(indexed) = controllers.get(&current.uid) else {
            break;
        };
        match &indexed.owner {
            Some(parent) if SUPPORTED_CONTROLLER_KINDS.contains(&parent.kind.as_str()) => {
                current = parent.clone();
            }
            _ => break,
        }
    }

    Some(ControllerRef {
        kind: current.kind,
        name: current.name,
        uid: current.uid,
    })
}
