//! Container resize executor: rewrites the resource limits of one
//! container in its controller's pod template.

use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;
use kube::api::PostParams;
use kube::Api;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::registry::ActionExecutor;
use super::types::ActionError;
use super::types::ActionItem;
use super::types::ActionSuccess;
use super::types::PROP_CONTAINER_NAME;
use super::types::PROP_RESIZE_RESOURCE;
use super::workload::controller_api;
use crate::cluster::groups::ControllerGroupVersions;

/// The resource dimension a resize applies to, named by the action
/// item's `ResizeResource` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeResource {
    /// New capacity in millicores.
    CpuMillicores,
    /// New capacity in KiB.
    MemoryKib,
}

impl ResizeResource {
    fn from_property(value: Option<&str>) -> Result<Self, ActionError> {
        match value {
            Some("cpu") => Ok(ResizeResource::CpuMillicores),
            Some("memory") => Ok(ResizeResource::MemoryKib),
            other => Err(ActionError::PreCheckFailed {
                message: format!("resize action names no resizable resource: {other:?}"),
            }),
        }
    }

    fn limit_key(&self) -> &'static str {
        match self {
            ResizeResource::CpuMillicores => "cpu",
            ResizeResource::MemoryKib => "memory",
        }
    }

    fn format_quantity(&self, value: f64) -> String {
        match self {
            ResizeResource::CpuMillicores => format!("{}m", value.round() as i64),
            ResizeResource::MemoryKib => format!("{}Ki", value.round() as i64),
        }
    }
}

pub struct ResizeExecutor {
    client: kube::Client,
    groups: ControllerGroupVersions,
}

impl ResizeExecutor {
    pub fn new(client: kube::Client, groups: ControllerGroupVersions) -> Self {
        Self { client, groups }
    }
}

#[async_trait]
impl ActionExecutor for ResizeExecutor {
    async fn execute(
        &self,
        item: &ActionItem,
        _cancel: &CancellationToken,
    ) -> Result<ActionSuccess, Report<ActionError>> {
        let new_capacity = item.new_capacity.ok_or_else(|| {
            Report::new(ActionError::PreCheckFailed {
                message: "resize action carries no new capacity".to_string(),
            })
        })?;
        let resource = ResizeResource::from_property(item.target.property(PROP_RESIZE_RESOURCE))
            .map_err(Report::new)?;
        let (namespace, pod_name) = item.target.namespaced_name().ok_or_else(|| {
            Report::new(ActionError::ResolutionFailed {
                message: "resize target does not identify a pod".to_string(),
            })
        })?;
        let container_name = item
            .target
            .property(PROP_CONTAINER_NAME)
            .ok_or_else(|| {
                Report::new(ActionError::ResolutionFailed {
                    message: "resize target does not name a container".to_string(),
                })
            })?
            .to_string();

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let pod = pods.get(&pod_name).await.map_err(|e| {
            Report::new(ActionError::ResolutionFailed {
                message: format!("target pod {namespace}/{pod_name} not found: {e}"),
            })
        })?;

        let parent = pod
            .metadata
            .owner_references
            .as_ref()
            .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
            .ok_or_else(|| {
                Report::new(ActionError::PreCheckFailed {
                    message: format!(
                        "pod {namespace}/{pod_name} has no controller; bare pods cannot be resized"
                    ),
                })
            })?;

        let api = controller_api(self.client.clone(), &self.groups, &parent.kind, &namespace)
            .map_err(Report::new)?;
        let mut controller = api.get(&parent.name).await.map_err(|e| {
            Report::new(ActionError::ExecutionFailed {
                message: format!("reading {} {namespace}/{}: {e}", parent.kind, parent.name),
            })
        })?;

        let quantity = resource.format_quantity(new_capacity);
        let changed = set_container_limit(
            &mut controller.data,
            &container_name,
            resource.limit_key(),
            &quantity,
        )
        .map_err(Report::new)?;
        if !changed {
            return Err(Report::new(ActionError::ExecutionFailed {
                message: format!(
                    "container {container_name} not present in template of {} {namespace}/{}",
                    parent.kind, parent.name
                ),
            }));
        }

        api.replace(&parent.name, &PostParams::default(), &controller)
            .await
            .map_err(|e| {
                Report::new(ActionError::ExecutionFailed {
                    message: format!(
                        "updating {} {namespace}/{} failed: {e}",
                        parent.kind, parent.name
                    ),
                })
            })?;

        info!(
            controller = %parent.name,
            container = %container_name,
            limit = %quantity,
            "container resized"
        );
        Ok(ActionSuccess::Resized {
            controller: format!("{}/{}", namespace, parent.name),
            container: container_name,
        })
    }
}

/// Sets `resources.limits.<key>` on the named container of a controller
/// pod template. Returns whether the container was found.
fn set_container_limit(
    data: &mut serde_json::Value,
    container_name: &str,
    limit_key: &str,
    quantity: &str,
) -> Result<bool, ActionError> {
    let containers = data
        .pointer_mut("/spec/template/spec/containers")
        .and_then(|c| c.as_array_mut())
        .ok_or_else(|| ActionError::ExecutionFailed {
            message: "controller has no pod template containers".to_string(),
        })?;

    for container in containers {
        if container.get("name").and_then(|n| n.as_str()) != Some(container_name) {
            continue;
        }
        let resources = container
            .as_object_mut()
            .ok_or_else(|| ActionError::ExecutionFailed {
                message: "malformed container entry in pod template".to_string(),
            })?
            .entry("resources")
            .or_insert_with(|| serde_json::json!({}));
        let limits = resources
            .as_object_mut()
            .ok_or_else(|| ActionError::ExecutionFailed {
                message: "malformed resources entry in pod template".to_string(),
            })?
            .entry("limits")
            .or_insert_with(|| serde_json::json!({}));
        limits
            .as_object_mut()
            .ok_or_else(|| ActionError::ExecutionFailed {
                message: "malformed limits entry in pod template".to_string(),
            })?
            .insert(limit_key.to_string(), serde_json::json!(quantity));
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(containers: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "spec": {"template": {"spec": {"containers": containers}}}
        })
    }

    #[test]
    fn sets_the_limit_on_the_named_container() {
        let mut data = template(serde_json::json!([
            {"name": "web", "resources": {"limits": {"cpu": "250m"}}},
            {"name": "sidecar"}
        ]));

        let changed = set_container_limit(&mut data, "web", "cpu", "500m").unwrap();
        assert!(changed);
        assert_eq!(
            data.pointer("/spec/template/spec/containers/0/resources/limits/cpu"),
            Some(&serde_json::json!("500m"))
        );
        // The sibling container is untouched.
        assert_eq!(
            data.pointer("/spec/template/spec/containers/1/resources"),
            None
        );
    }

    #[test]
    fn creates_missing_resources_sections() {
        let mut data = template(serde_json::json!([{"name": "web"}]));
        let changed = set_container_limit(&mut data, "web", "memory", "131072Ki").unwrap();
        assert!(changed);
        assert_eq!(
            data.pointer("/spec/template/spec/containers/0/resources/limits/memory"),
            Some(&serde_json::json!("131072Ki"))
        );
    }

    #[test]
    fn unknown_container_reports_not_found() {
        let mut data = template(serde_json::json!([{"name": "web"}]));
        assert!(!set_container_limit(&mut data, "other", "cpu", "1m").unwrap());
    }

    #[test]
    fn templateless_controller_is_an_error() {
        let mut data = serde_json::json!({"spec": {}});
        assert!(set_container_limit(&mut data, "web", "cpu", "1m").is_err());
    }

    #[test]
    fn quantities_are_formatted_per_resource() {
        assert_eq!(ResizeResource::CpuMillicores.format_quantity(512.4), "512m");
        assert_eq!(ResizeResource::MemoryKib.format_quantity(2048.0), "2048Ki");
    }

    #[test]
    fn resize_resource_comes_from_the_descriptor_property() {
        assert_eq!(
            ResizeResource::from_property(Some("cpu")).unwrap(),
            ResizeResource::CpuMillicores
        );
        assert_eq!(
            ResizeResource::from_property(Some("memory")).unwrap(),
            ResizeResource::MemoryKib
        );
        assert!(ResizeResource::from_property(None).is_err());
        assert!(ResizeResource::from_property(Some("disk")).is_err());
    }
}
