//! Local pod move mechanics: bind a clone of the pod to the target node,
//! wait for it to run, then remove the original. The clone is rolled
//! back if it never becomes ready.

use std::time::Duration;

use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DeleteParams;
use kube::api::PostParams;
use kube::Api;
use tracing::info;
use tracing::warn;
use utils::retry_during;

use super::types::ActionError;
use crate::federation::format_base32;

const READY_ATTEMPTS: usize = 40;
const READY_TIMEOUT: Duration = Duration::from_secs(120);
const READY_INTERVAL: Duration = Duration::from_secs(3);

pub struct PodMover {
    client: kube::Client,
}

impl PodMover {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// Moves the pod onto `target_node` and returns the new pod. On
    /// failure the clone is deleted and the original left untouched.
    pub async fn move_pod(&self, pod: &Pod, target_node: &str) -> Result<Pod, Report<ActionError>> {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let original_name = pod.metadata.name.clone().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        let clone = bound_clone(pod, target_node);
        let clone_name = clone.metadata.name.clone().unwrap_or_default();

        api.create(&PostParams::default(), &clone).await.map_err(|e| {
            Report::new(ActionError::ExecutionFailed {
                message: format!(
                    "failed to create moved pod {namespace}/{clone_name} on {target_node}: {e}"
                ),
            })
        })?;

        if let Err(e) = self.wait_until_running(&api, &clone_name).await {
            warn!(pod = %clone_name, "moved pod never became ready, rolling back");
            if let Err(del) = api.delete(&clone_name, &DeleteParams::default()).await {
                warn!(pod = %clone_name, "rollback delete failed: {del}");
            }
            return Err(e);
        }

        api.delete(&original_name, &DeleteParams::default())
            .await
            .map_err(|e| {
                Report::new(ActionError::ExecutionFailed {
                    message: format!(
                        "moved pod {namespace}/{clone_name} is running but deleting the original \
                         {original_name} failed: {e}"
                    ),
                })
            })?;

        info!(
            old = %original_name,
            new = %clone_name,
            node = %target_node,
            "pod move completed"
        );

        api.get(&clone_name).await.map_err(|e| {
            Report::new(ActionError::ExecutionFailed {
                message: format!("failed to read back moved pod {clone_name}: {e}"),
            })
        })
    }

    async fn wait_until_running(
        &self,
        api: &Api<Pod>,
        name: &str,
    ) -> Result<(), Report<ActionError>> {
        retry_during(READY_ATTEMPTS, READY_TIMEOUT, READY_INTERVAL, || async {
            let pod = api.get(name).await.map_err(|e| e.to_string())?;
            match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
                Some("Running") => Ok(()),
                phase => Err(format!("pod {name} in phase {phase:?}")),
            }
        })
        .await
        .map_err(|e| {
            Report::new(ActionError::ExecutionFailed {
                message: format!("moved pod {name} not running: {e}"),
            })
        })
    }
}

/// A copy of the pod bound to the target node: fresh identity, no owner
/// references, no accumulated status.
fn bound_clone(pod: &Pod, target_node: &str) -> Pod {
    let mut clone = pod.clone();

    let original_name = pod.metadata.name.clone().unwrap_or_default();
    let suffix = format_base32(chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default());
    let short = &suffix[suffix.len().saturating_sub(6)..];
    let mut name = format!("{original_name}-move-{short}");
    name.truncate(63);

    clone.metadata.name = Some(name);
    clone.metadata.uid = None;
    clone.metadata.resource_version = None;
    clone.metadata.creation_timestamp = None;
    clone.metadata.owner_references = None;
    clone.metadata.managed_fields = None;
    clone.status = None;
    if let Some(spec) = clone.spec.as_mut() {
        spec.node_name = Some(target_node.to_string());
    }
    clone
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    use super::*;

    #[test]
    fn clone_is_bound_to_the_target_with_fresh_identity() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-1".to_string()),
                resource_version: Some("42".to_string()),
                owner_references: Some(vec![OwnerReference::default()]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("n1".to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus::default()),
        };

        let clone = bound_clone(&pod, "n2");
        let clone_name = clone.metadata.name.as_deref().unwrap();

        assert!(clone_name.starts_with("web-0-move-"));
        assert!(clone_name.len() <= 63);
        assert_eq!(clone.metadata.uid, None);
        assert_eq!(clone.metadata.resource_version, None);
        assert_eq!(clone.metadata.owner_references, None);
        assert_eq!(clone.status, None);
        assert_eq!(clone.spec.unwrap().node_name.as_deref(), Some("n2"));
    }
}
