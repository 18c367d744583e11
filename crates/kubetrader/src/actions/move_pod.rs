//! Pod move / reschedule executor, including the cross-cluster path.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::pod_mover::PodMover;
use super::registry::ActionExecutor;
use super::resolver::NodeResolver;
use super::types::ActionError;
use super::types::ActionItem;
use super::types::ActionSuccess;
use crate::cluster::groups::KIND_DAEMON_SET;
use crate::cluster::groups::KIND_DEPLOYMENT;
use crate::cluster::groups::KIND_DEPLOYMENT_CONFIG;
use crate::cluster::groups::KIND_JOB;
use crate::cluster::groups::KIND_REPLICA_SET;
use crate::cluster::groups::KIND_REPLICATION_CONTROLLER;
use crate::cluster::groups::KIND_STATEFUL_SET;
use crate::federation::ActionPhase;
use crate::federation::FederationClient;

const SCC_ANNOTATION: &str = "openshift.io/scc";

/// Parent kinds a pod may have for a move to be attempted. CronJobs are
/// excluded: their pods belong to transient Jobs.
const MOVABLE_PARENT_KINDS: [&str; 7] = [
    KIND_DAEMON_SET,
    KIND_DEPLOYMENT,
    KIND_DEPLOYMENT_CONFIG,
    KIND_JOB,
    KIND_REPLICA_SET,
    KIND_REPLICATION_CONTROLLER,
    KIND_STATEFUL_SET,
];

/// The configured `scc-support` allow-set; `*` allows every SCC.
#[derive(Debug, Clone)]
pub struct SccAllowSet {
    allow_all: bool,
    allowed: HashSet<String>,
}

impl SccAllowSet {
    pub fn from_list(list: &[String]) -> Self {
        Self {
            allow_all: list.iter().any(|s| s == "*"),
            allowed: list.iter().cloned().collect(),
        }
    }

    /// Pods without an SCC annotation are unconstrained.
    pub fn permits(&self, pod: &Pod) -> bool {
        if self.allow_all {
            return true;
        }
        match pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(SCC_ANNOTATION))
        {
            Some(scc) => self.allowed.contains(scc),
            None => true,
        }
    }
}

pub struct MoveExecutor {
    client: kube::Client,
    resolver: NodeResolver,
    federation: Option<Arc<FederationClient>>,
    mover: PodMover,
    scc_allowed: SccAllowSet,
    fail_volume_pod_moves: bool,
}

impl MoveExecutor {
    pub fn new(
        client: kube::Client,
        resolver: NodeResolver,
        federation: Option<Arc<FederationClient>>,
        scc_allowed: SccAllowSet,
        fail_volume_pod_moves: bool,
    ) -> Self {
        Self {
            mover: PodMover::new(client.clone()),
            client,
            resolver,
            federation,
            scc_allowed,
            fail_volume_pod_moves,
        }
    }

    async fn target_pod(&self, item: &ActionItem) -> Result<Pod, Report<ActionError>> {
        let (namespace, name) = item.target.namespaced_name().ok_or_else(|| {
            Report::new(ActionError::ResolutionFailed {
                message: "move target does not identify a pod".to_string(),
            })
        })?;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        api.get(&name).await.map_err(|e| {
            Report::new(ActionError::ResolutionFailed {
                message: format!("target pod {namespace}/{name} not found: {e}"),
            })
        })
    }

    /// Pre-action node condition checks are advisory only.
    async fn warn_on_node_conditions(&self, node_name: &str, pod: &str) {
        let api: Api<Node> = Api::all(self.client.clone());
        let Ok(node) = api.get(node_name).await else {
            warn!(node = %node_name, "could not read destination node for condition check");
            return;
        };
        let Some(conditions) = node.status.as_ref().and_then(|s| s.conditions.as_ref()) else {
            warn!(pod, node = %node_name, "destination node condition is unknown");
            return;
        };
        for condition in conditions {
            let healthy = if condition.type_ == "Ready" {
                condition.status == "True"
            } else {
                condition.status != "True"
            };
            if !healthy {
                warn!(
                    pod,
                    node = %node_name,
                    condition = %condition.type_,
                    "destination node in bad condition"
                );
            }
        }
    }
}

#[async_trait]
impl ActionExecutor for MoveExecutor {
    async fn execute(
        &self,
        item: &ActionItem,
        cancel: &CancellationToken,
    ) -> Result<ActionSuccess, Report<ActionError>> {
        let new_host = item.new_host.as_ref().ok_or_else(|| {
            Report::new(ActionError::ResolutionFailed {
                message: "move action carries no destination host".to_string(),
            })
        })?;

        let pod = self.target_pod(item).await?;
        let pod_full_name = format!(
            "{}/{}",
            pod.metadata.namespace.as_deref().unwrap_or_default(),
            pod.metadata.name.as_deref().unwrap_or_default()
        );

        let destination = self.resolver.resolve(new_host).await?;

        if let Some(destination_cluster) = destination.cluster {
            let Some(federation) = &self.federation else {
                return Err(Report::new(ActionError::ExecutionFailed {
                    message: format!(
                        "move of {pod_full_name} targets cluster {destination_cluster} but no \
                         federation client is configured"
                    ),
                }));
            };

            // No local mutation: the federation controller performs the
            // move; we watch the Action CR until it is terminal.
            let action_name = federation
                .create_move_action(
                    pod.metadata.namespace.as_deref().unwrap_or_default(),
                    pod.metadata.name.as_deref().unwrap_or_default(),
                    &destination.name,
                    &destination_cluster,
                )
                .await
                .map_err(|e| {
                    e.change_context(ActionError::ExecutionFailed {
                        message: format!(
                            "failed to create federated move of {pod_full_name} to \
                             {destination_cluster}"
                        ),
                    })
                })?;

            return match federation.await_action_outcome(&action_name, cancel).await {
                Ok(ActionPhase::Succeeded) => Ok(ActionSuccess::CrossClusterMoveCompleted {
                    destination_cluster,
                    action_name,
                }),
                Ok(phase) => Err(Report::new(ActionError::ExecutionFailed {
                    message: format!(
                        "federated move {action_name} of {pod_full_name} to \
                         {destination_cluster} ended in {phase:?}"
                    ),
                })),
                Err(e) => Err(e.change_context(ActionError::ExecutionFailed {
                    message: format!(
                        "federated move {action_name} of {pod_full_name} to \
                         {destination_cluster} has no known outcome"
                    ),
                })),
            };
        }

        self.warn_on_node_conditions(&destination.name, &pod_full_name)
            .await;

        pre_check(
            &pod,
            &destination.name,
            &self.scc_allowed,
            self.fail_volume_pod_moves,
        )
        .map_err(Report::new)?;

        let new_pod = self.mover.move_pod(&pod, &destination.name).await?;
        Ok(ActionSuccess::PodMoved {
            old_pod: pod_full_name,
            new_pod: format!(
                "{}/{}",
                new_pod.metadata.namespace.as_deref().unwrap_or_default(),
                new_pod.metadata.name.as_deref().unwrap_or_default()
            ),
        })
    }
}

/// Checks whether the move may be executed at all. Any pod that is not
/// `Running` aborts the move.
pub fn pre_check(
    pod: &Pod,
    target_node: &str,
    scc_allowed: &SccAllowSet,
    fail_volume_pod_moves: bool,
) -> Result<(), ActionError> {
    let full_name = format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default()
    );

    if !scc_allowed.permits(pod) {
        return Err(ActionError::PreCheckFailed {
            message: format!("pod {full_name} has an unsupported SCC"),
        });
    }

    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    if phase != Some("Running") {
        return Err(ActionError::PreCheckFailed {
            message: format!("pod {full_name} is in phase {phase:?}, not Running"),
        });
    }

    if pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(target_node) {
        return Err(ActionError::PreCheckFailed {
            message: format!("pod {full_name} is already on host {target_node}"),
        });
    }

    if let Some(parent) = pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
    {
        if !MOVABLE_PARENT_KINDS.contains(&parent.kind.as_str()) {
            return Err(ActionError::PreCheckFailed {
                message: format!(
                    "parent kind {} of pod {full_name} is not supported",
                    parent.kind
                ),
            });
        }
    }

    if fail_volume_pod_moves && has_persistent_volumes(pod) {
        return Err(ActionError::PreCheckFailed {
            message: format!("pod {full_name} has attached volumes and volume pod moves are disabled"),
        });
    }

    Ok(())
}

fn has_persistent_volumes(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(|volumes| volumes.iter().any(|v| v.persistent_volume_claim.is_some()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::api::core::v1::Volume;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    use super::*;
    use crate::cluster::groups::KIND_CRON_JOB;

    fn running_pod(node: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
        }
    }

    fn allow_all() -> SccAllowSet {
        SccAllowSet::from_list(&["*".to_string()])
    }

    #[test]
    fn rejects_move_to_the_current_host() {
        let pod = running_pod("n1");
        let err = pre_check(&pod, "n1", &allow_all(), true).unwrap_err();
        assert!(err.to_string().contains("already on host"));
    }

    #[test]
    fn accepts_move_to_another_host() {
        let pod = running_pod("n1");
        assert!(pre_check(&pod, "n2", &allow_all(), true).is_ok());
    }

    #[test]
    fn rejects_pods_that_are_not_running() {
        let mut pod = running_pod("n1");
        pod.status.as_mut().unwrap().phase = Some("Succeeded".to_string());
        let err = pre_check(&pod, "n2", &allow_all(), true).unwrap_err();
        assert!(err.to_string().contains("not Running"));
    }

    #[test]
    fn rejects_unsupported_parent_kinds() {
        let mut pod = running_pod("n1");
        pod.metadata.owner_references = Some(vec![OwnerReference {
            kind: KIND_CRON_JOB.to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        let err = pre_check(&pod, "n2", &allow_all(), true).unwrap_err();
        assert!(err.to_string().contains("not supported"));

        pod.metadata.owner_references = Some(vec![OwnerReference {
            kind: KIND_REPLICA_SET.to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        assert!(pre_check(&pod, "n2", &allow_all(), true).is_ok());
    }

    #[test]
    fn volume_policy_blocks_pvc_backed_pods() {
        let mut pod = running_pod("n1");
        pod.spec.as_mut().unwrap().volumes = Some(vec![Volume {
            name: "data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: "data".to_string(),
                read_only: None,
            }),
            ..Default::default()
        }]);

        assert!(pre_check(&pod, "n2", &allow_all(), true).is_err());
        // Policy disabled: the same pod may move.
        assert!(pre_check(&pod, "n2", &allow_all(), false).is_ok());
    }

    #[test]
    fn scc_allow_set_gates_annotated_pods() {
        let restricted = SccAllowSet::from_list(&["restricted".to_string()]);

        let mut pod = running_pod("n1");
        assert!(restricted.permits(&pod)); // no annotation

        let mut annotations = BTreeMap::new();
        annotations.insert(SCC_ANNOTATION.to_string(), "privileged".to_string());
        pod.metadata.annotations = Some(annotations.clone());
        assert!(!restricted.permits(&pod));
        let err = pre_check(&pod, "n2", &restricted, true).unwrap_err();
        assert!(err.to_string().contains("unsupported SCC"));

        annotations.insert(SCC_ANNOTATION.to_string(), "restricted".to_string());
        pod.metadata.annotations = Some(annotations);
        assert!(restricted.permits(&pod));

        assert!(allow_all().permits(&pod));
    }
}
