//! Federation control-plane client.
//!
//! Cross-cluster moves are expressed as `Action` custom resources in the
//! federation namespace, observed by the federation controller. Member
//! clusters publish their node lists on `KubeFedCluster` resources.
//! Federation payloads are untyped maps; every field access goes through
//! the explicit extraction helpers below.

use core::error::Error;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;
use kube::api::ApiResource;
use kube::api::DynamicObject;
use kube::api::GroupVersionKind;
use kube::api::ListParams;
use kube::api::PostParams;
use kube::Api;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub const ACTION_GROUP: &str = "turbo.kubefed.io";
pub const ACTION_VERSION: &str = "v1alpha1";
pub const ACTION_KIND: &str = "Action";
pub const ACTION_NAME_PREFIX: &str = "kubeturbo-action-";

pub const CLUSTER_GROUP: &str = "core.kubefed.io";
pub const CLUSTER_VERSION: &str = "v1beta1";
pub const CLUSTER_KIND: &str = "KubeFedCluster";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_POLL_DEADLINE: Duration = Duration::from_secs(300);

#[derive(Debug, Display)]
pub enum FederationError {
    #[display("failed to list federated clusters: {message}")]
    ListFailed { message: String },
    #[display("failed to create federated action: {message}")]
    CreateFailed { message: String },
    #[display("malformed federation payload: {message}")]
    MalformedPayload { message: String },
    #[display("outcome of federated action {action} is unknown: {message}")]
    OutcomeUnknown { action: String, message: String },
}

impl Error for FederationError {}

/// A node published by a federation member cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederatedNode {
    pub uid: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct MemberCluster {
    pub name: String,
    pub nodes: Vec<FederatedNode>,
}

/// Terminal and non-terminal states of a federated action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionPhase {
    InProgress,
    Succeeded,
    Failed,
}

pub struct FederationClient {
    client: kube::Client,
    namespace: String,
    cluster_name: String,
}

impl FederationClient {
    pub fn new(client: kube::Client, namespace: String, cluster_name: String) -> Self {
        Self {
            client,
            namespace,
            cluster_name,
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    fn actions_api(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(ACTION_GROUP, ACTION_VERSION, ACTION_KIND);
        let ar = ApiResource::from_gvk(&gvk);
        Api::namespaced_with(self.client.clone(), &self.namespace, &ar)
    }

    fn clusters_api(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(CLUSTER_GROUP, CLUSTER_VERSION, CLUSTER_KIND);
        let ar = ApiResource::from_gvk(&gvk);
        Api::namespaced_with(self.client.clone(), &self.namespace, &ar)
    }

    /// Reads the member clusters and the node lists they publish.
    /// Clusters with missing or malformed node lists are skipped.
    pub async fn member_clusters(&self) -> Result<Vec<MemberCluster>, Report<FederationError>> {
        let list = self
            .clusters_api()
            .list(&ListParams::default())
            .await
            .map_err(|e| {
                Report::new(FederationError::ListFailed {
                    message: e.to_string(),
                })
            })?;

        let mut clusters = Vec::new();
        for item in list.items {
            let cluster_name = item.name_any();
            let node_list = match nested_slice(&item.data, &["status", "nodeList"]) {
                Ok(Some(nodes)) => nodes,
                Ok(None) => {
                    debug!(cluster = %cluster_name, "node list not published yet");
                    continue;
                }
                Err(e) => {
                    warn!(cluster = %cluster_name, "skipping cluster: {e}");
                    continue;
                }
            };

            let mut nodes = Vec::new();
            for entry in node_list {
                let uid = nested_string(entry, &["uid"]);
                let name = nested_string(entry, &["name"]);
                match (uid, name) {
                    (Ok(Some(uid)), Ok(Some(name))) => nodes.push(FederatedNode { uid, name }),
                    _ => warn!(cluster = %cluster_name, "node entry missing uid or name"),
                }
            }
            clusters.push(MemberCluster {
                name: cluster_name,
                nodes,
            });
        }
        Ok(clusters)
    }

    /// Looks a node UID up across all member clusters' published lists.
    pub async fn find_node_by_uid(
        &self,
        uid: &str,
    ) -> Result<Option<(FederatedNode, String)>, Report<FederationError>> {
        for cluster in self.member_clusters().await? {
            if let Some(node) = cluster.nodes.iter().find(|n| n.uid == uid) {
                info!(node = %node.name, cluster = %cluster.name, "found node in federated cluster");
                return Ok(Some((node.clone(), cluster.name)));
            }
        }
        Ok(None)
    }

    /// Creates the cross-cluster move Action CR and returns its name.
    pub async fn create_move_action(
        &self,
        pod_namespace: &str,
        pod_name: &str,
        target_node: &str,
        destination_cluster: &str,
    ) -> Result<String, Report<FederationError>> {
        let gvk = GroupVersionKind::gvk(ACTION_GROUP, ACTION_VERSION, ACTION_KIND);
        let ar = ApiResource::from_gvk(&gvk);

        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        let name = format!("{ACTION_NAME_PREFIX}{}", format_base32(nanos));

        let mut action = DynamicObject::new(&name, &ar);
        action.metadata.namespace = Some(self.namespace.clone());
        action.data = move_action_spec(
            pod_namespace,
            pod_name,
            target_node,
            &self.cluster_name,
            destination_cluster,
        );

        self.actions_api()
            .create(&PostParams::default(), &action)
            .await
            .map_err(|e| {
                Report::new(FederationError::CreateFailed {
                    message: e.to_string(),
                })
            })?;

        info!(action = %name, destination = %destination_cluster, "created federated move action");
        Ok(name)
    }

    /// Polls the Action CR status until it reaches a terminal state. The
    /// federation controller performing the move is asynchronous; the
    /// true outcome must be read back before reporting to the market.
    pub async fn await_action_outcome(
        &self,
        action_name: &str,
        cancel: &CancellationToken,
    ) -> Result<ActionPhase, Report<FederationError>> {
        let api = self.actions_api();
        let deadline = tokio::time::Instant::now() + DEFAULT_POLL_DEADLINE;

        loop {
            if cancel.is_cancelled() {
                return Err(Report::new(FederationError::OutcomeUnknown {
                    action: action_name.to_string(),
                    message: "cancelled while waiting".to_string(),
                }));
            }

            match api.get(action_name).await {
                Ok(obj) => match action_phase(&obj.data)? {
                    ActionPhase::InProgress => {
                        debug!(action = %action_name, "federated action still in progress")
                    }
                    terminal => return Ok(terminal),
                },
                Err(e) => warn!(action = %action_name, "failed to poll federated action: {e}"),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Report::new(FederationError::OutcomeUnknown {
                    action: action_name.to_string(),
                    message: format!("no terminal state within {DEFAULT_POLL_DEADLINE:?}"),
                }));
            }
            tokio::select! {
                _ = tokio::time::sleep(DEFAULT_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }
}

/// The spec payload of a cross-cluster move Action CR.
pub fn move_action_spec(
    pod_namespace: &str,
    pod_name: &str,
    target_node: &str,
    source_cluster: &str,
    destination_cluster: &str,
) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "targetRef": {
                "kind": "pod",
                "name": pod_name,
                "namespace": pod_namespace,
            },
            "clusters": {
                "source": source_cluster,
                "destination": destination_cluster,
            },
            "targetNode": target_node,
        }
    })
}

/// Reads `.status.state` from an Action payload.
pub fn action_phase(data: &serde_json::Value) -> Result<ActionPhase, Report<FederationError>> {
    match nested_string(data, &["status", "state"]) {
        Ok(Some(state)) => match state.as_str() {
            "Succeeded" => Ok(ActionPhase::Succeeded),
            "Failed" => Ok(ActionPhase::Failed),
            _ => Ok(ActionPhase::InProgress),
        },
        Ok(None) => Ok(ActionPhase::InProgress),
        Err(e) => Err(e),
    }
}

/// Extracts a string at `path`. `Ok(None)` means the field is absent; an
/// error means it exists with the wrong type.
pub fn nested_string(
    value: &serde_json::Value,
    path: &[&str],
) -> Result<Option<String>, Report<FederationError>> {
    match nested(value, path) {
        None => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| type_mismatch(path, "string", v)),
    }
}

/// Extracts an array at `path`, with the same absent/mismatch contract
/// as [`nested_string`].
pub fn nested_slice<'a>(
    value: &'a serde_json::Value,
    path: &[&str],
) -> Result<Option<&'a Vec<serde_json::Value>>, Report<FederationError>> {
    match nested(value, path) {
        None => Ok(None),
        Some(v) => v
            .as_array()
            .map(Some)
            .ok_or_else(|| type_mismatch(path, "array", v)),
    }
}

fn nested<'a>(value: &'a serde_json::Value, path: &[&str]) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current)
}

fn type_mismatch(
    path: &[&str],
    expected: &str,
    actual: &serde_json::Value,
) -> Report<FederationError> {
    Report::new(FederationError::MalformedPayload {
        message: format!(
            "field .{} is not a {expected}: {actual}",
            path.join(".")
        ),
    })
}

/// Formats a number in base 32 with the digits `0-9a-v`, matching the
/// scheme used for action names.
pub fn format_base32(mut value: i64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuv";
    if value == 0 {
        return "0".to_string();
    }
    let negative = value < 0;
    let mut out = Vec::new();
    while value != 0 {
        out.push(DIGITS[(value.unsigned_abs() % 32) as usize]);
        value /= 32;
    }
    if negative {
        out.push(b'-');
    }
    out.reverse();
    String::from_utf8(out).expect("base32 digits are ascii")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base32_formatting_matches_the_naming_scheme() {
        assert_eq!(format_base32(0), "0");
        assert_eq!(format_base32(31), "v");
        assert_eq!(format_base32(32), "10");
        assert_eq!(format_base32(1_000_000_000), "tplig0");
    }

    #[test]
    fn nested_string_distinguishes_absent_from_mismatched() {
        let value = serde_json::json!({
            "status": {"state": "Succeeded", "count": 3}
        });

        assert_eq!(
            nested_string(&value, &["status", "state"]).unwrap(),
            Some("Succeeded".to_string())
        );
        assert_eq!(nested_string(&value, &["status", "missing"]).unwrap(), None);
        assert!(nested_string(&value, &["status", "count"]).is_err());
    }

    #[test]
    fn nested_slice_reads_node_lists() {
        let value = serde_json::json!({
            "status": {
                "nodeList": [
                    {"uid": "u1", "name": "n1"},
                    {"uid": "u2", "name": "n2"}
                ]
            }
        });
        let nodes = nested_slice(&value, &["status", "nodeList"]).unwrap().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(
            nested_string(&nodes[0], &["uid"]).unwrap(),
            Some("u1".to_string())
        );
    }

    #[test]
    fn move_action_spec_names_pod_node_and_clusters() {
        let spec = move_action_spec("default", "web-0", "nodeB1", "clusterA", "clusterB");

        assert_eq!(
            nested_string(&spec, &["spec", "targetRef", "name"]).unwrap(),
            Some("web-0".to_string())
        );
        assert_eq!(
            nested_string(&spec, &["spec", "targetRef", "namespace"]).unwrap(),
            Some("default".to_string())
        );
        assert_eq!(
            nested_string(&spec, &["spec", "clusters", "source"]).unwrap(),
            Some("clusterA".to_string())
        );
        assert_eq!(
            nested_string(&spec, &["spec", "clusters", "destination"]).unwrap(),
            Some("clusterB".to_string())
        );
        assert_eq!(
            nested_string(&spec, &["spec", "targetNode"]).unwrap(),
            Some("nodeB1".to_string())
        );
    }

    #[test]
    fn action_phase_defaults_to_in_progress() {
        assert_eq!(
            action_phase(&serde_json::json!({})).unwrap(),
            ActionPhase::InProgress
        );
        assert_eq!(
            action_phase(&serde_json::json!({"status": {"state": "Running"}})).unwrap(),
            ActionPhase::InProgress
        );
        assert_eq!(
            action_phase(&serde_json::json!({"status": {"state": "Failed"}})).unwrap(),
            ActionPhase::Failed
        );
    }
}
