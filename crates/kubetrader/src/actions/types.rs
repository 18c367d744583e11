//! Action items received from the market and the shared executor
//! contract.

use core::error::Error;

use derive_more::Display;
use serde::Deserialize;
use serde::Serialize;

use crate::metrics::EntityKind;

pub const PROP_NAMESPACE: &str = "KubernetesNamespace";
pub const PROP_POD_NAME: &str = "KubernetesPodName";
pub const PROP_NODE_NAME: &str = "KubernetesNodeName";
pub const PROP_CONTAINER_NAME: &str = "KubernetesContainerName";
pub const PROP_CONTROLLER_KIND: &str = "ControllerKind";
/// Names the dimension of a resize: `cpu` or `memory`.
pub const PROP_RESIZE_RESOURCE: &str = "ResizeResource";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    Move,
    Resize,
    Provision,
    Suspend,
}

/// The market's description of an entity: a mix of identifiers the
/// resolver tries in a fixed order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub entity_kind: Option<EntityKind>,
    pub uuid: String,
    pub display_name: String,
    #[serde(default)]
    pub properties: Vec<DescriptorProperty>,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
}

impl EntityDescriptor {
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// The `namespace/name` pair of a pod descriptor, from properties or
    /// the display name.
    pub fn namespaced_name(&self) -> Option<(String, String)> {
        if let (Some(namespace), Some(name)) =
            (self.property(PROP_NAMESPACE), self.property(PROP_POD_NAME))
        {
            return Some((namespace.to_string(), name.to_string()));
        }
        self.display_name
            .split_once('/')
            .map(|(namespace, name)| (namespace.to_string(), name.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorProperty {
    pub name: String,
    pub value: String,
}

/// One action received from the market. Actions are never retried
/// locally; the market owns identity and retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionItem {
    pub id: i64,
    pub action_type: ActionType,
    pub target: EntityDescriptor,
    pub new_host: Option<EntityDescriptor>,
    pub new_capacity: Option<f64>,
}

/// Typed success variants shared by all executors.
#[derive(Debug, Clone)]
pub enum ActionSuccess {
    PodMoved {
        old_pod: String,
        new_pod: String,
    },
    CrossClusterMoveCompleted {
        destination_cluster: String,
        action_name: String,
    },
    Resized {
        controller: String,
        container: String,
    },
    Scaled {
        controller: String,
        replicas: i32,
    },
}

#[derive(Debug, Display)]
pub enum ActionError {
    #[display("no executor registered for {action_type:?} on {target_kind:?}")]
    Unsupported {
        action_type: ActionType,
        target_kind: Option<EntityKind>,
    },
    #[display("failed to resolve action target: {message}")]
    ResolutionFailed { message: String },
    #[display("pre-check rejected action: {message}")]
    PreCheckFailed { message: String },
    #[display("action execution failed: {message}")]
    ExecutionFailed { message: String },
}

impl Error for ActionError {}

/// The outcome reported back to the market. The message must identify
/// the target pod, the destination node and the reason on failure.
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub action_id: i64,
    pub succeeded: bool,
    pub message: String,
    pub old_pod: Option<String>,
    pub new_pod: Option<String>,
}

impl ActionOutcome {
    pub fn success(action_id: i64, result: &ActionSuccess) -> Self {
        let (message, old_pod, new_pod) = match result {
            ActionSuccess::PodMoved { old_pod, new_pod } => (
                format!("moved pod {old_pod} to {new_pod}"),
                Some(old_pod.clone()),
                Some(new_pod.clone()),
            ),
            ActionSuccess::CrossClusterMoveCompleted {
                destination_cluster,
                action_name,
            } => (
                format!("cross-cluster move {action_name} completed on {destination_cluster}"),
                None,
                None,
            ),
            ActionSuccess::Resized {
                controller,
                container,
            } => (
                format!("resized container {container} of {controller}"),
                None,
                None,
            ),
            ActionSuccess::Scaled {
                controller,
                replicas,
            } => (format!("scaled {controller} to {replicas} replicas"), None, None),
        };
        Self {
            action_id,
            succeeded: true,
            message,
            old_pod,
            new_pod,
        }
    }

    pub fn failure(action_id: i64, message: impl Into<String>) -> Self {
        Self {
            action_id,
            succeeded: false,
            message: message.into(),
            old_pod: None,
            new_pod: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_name_prefers_properties() {
        let descriptor = EntityDescriptor {
            display_name: "other/name".to_string(),
            properties: vec![
                DescriptorProperty {
                    name: PROP_NAMESPACE.to_string(),
                    value: "prod".to_string(),
                },
                DescriptorProperty {
                    name: PROP_POD_NAME.to_string(),
                    value: "web-0".to_string(),
                },
            ],
            ..Default::default()
        };
        assert_eq!(
            descriptor.namespaced_name(),
            Some(("prod".to_string(), "web-0".to_string()))
        );
    }

    #[test]
    fn namespaced_name_falls_back_to_display_name() {
        let descriptor = EntityDescriptor {
            display_name: "default/web-0".to_string(),
            ..Default::default()
        };
        assert_eq!(
            descriptor.namespaced_name(),
            Some(("default".to_string(), "web-0".to_string()))
        );

        let nameless = EntityDescriptor::default();
        assert_eq!(nameless.namespaced_name(), None);
    }
}
