//! Resolves a market-provided entity descriptor to a concrete cluster
//! node, possibly on a federated peer cluster.

use std::sync::Arc;

use error_stack::Report;
use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::Api;
use tracing::debug;

use super::types::ActionError;
use super::types::EntityDescriptor;
use super::types::PROP_NODE_NAME;
use crate::federation::FederationClient;

/// The resolver's verdict: a node name plus the destination cluster when
/// the node lives on a federation peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNode {
    pub name: String,
    pub uid: String,
    /// `Some` marks a cross-cluster action.
    pub cluster: Option<String>,
}

pub struct NodeResolver {
    client: kube::Client,
    federation: Option<Arc<FederationClient>>,
}

impl NodeResolver {
    pub fn new(client: kube::Client, federation: Option<Arc<FederationClient>>) -> Self {
        Self { client, federation }
    }

    /// Tries, in order: node-name property, VM UUID, federated cluster
    /// lookup, display name, IP list. The first hit wins; a miss is
    /// fatal for the action.
    pub async fn resolve(
        &self,
        descriptor: &EntityDescriptor,
    ) -> Result<ResolvedNode, Report<ActionError>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default())
            .await
            .map_err(|e| {
                Report::new(ActionError::ResolutionFailed {
                    message: format!("listing nodes: {e}"),
                })
            })?
            .items;

        if let Some(node) = match_by_property(&nodes, descriptor) {
            debug!(node = %node.name, "resolved node from entity properties");
            return Ok(node);
        }
        if let Some(node) = match_by_uuid(&nodes, descriptor) {
            debug!(node = %node.name, "resolved node by uuid");
            return Ok(node);
        }

        if let Some(federation) = &self.federation {
            if !descriptor.uuid.is_empty() {
                match federation.find_node_by_uid(&descriptor.uuid).await {
                    Ok(Some((node, cluster))) => {
                        return Ok(ResolvedNode {
                            name: node.name,
                            uid: node.uid,
                            cluster: Some(cluster),
                        });
                    }
                    Ok(None) => {}
                    Err(e) => debug!("federated node lookup failed: {e:?}"),
                }
            }
        }

        if let Some(node) = match_by_display_name(&nodes, descriptor) {
            debug!(node = %node.name, "resolved node by display name");
            return Ok(node);
        }
        if let Some(node) = match_by_ip(&nodes, descriptor) {
            debug!(node = %node.name, "resolved node by ip");
            return Ok(node);
        }

        Err(Report::new(ActionError::ResolutionFailed {
            message: format!(
                "no node matches descriptor (uuid {}, name {}, {} ips)",
                descriptor.uuid,
                descriptor.display_name,
                descriptor.ip_addresses.len()
            ),
        }))
    }
}

fn resolved(node: &Node) -> ResolvedNode {
    ResolvedNode {
        name: node.metadata.name.clone().unwrap_or_default(),
        uid: node.metadata.uid.clone().unwrap_or_default(),
        cluster: None,
    }
}

fn match_by_property(nodes: &[Node], descriptor: &EntityDescriptor) -> Option<ResolvedNode> {
    let wanted = descriptor.property(PROP_NODE_NAME)?;
    nodes
        .iter()
        .find(|n| n.metadata.name.as_deref() == Some(wanted))
        .map(resolved)
}

fn match_by_uuid(nodes: &[Node], descriptor: &EntityDescriptor) -> Option<ResolvedNode> {
    if descriptor.uuid.is_empty() {
        return None;
    }
    nodes
        .iter()
        .find(|n| {
            let system_uuid = n
                .status
                .as_ref()
                .and_then(|s| s.node_info.as_ref())
                .map(|i| i.system_uuid.as_str())
                .unwrap_or("");
            system_uuid.eq_ignore_ascii_case(&descriptor.uuid)
                || n.metadata.uid.as_deref() == Some(descriptor.uuid.as_str())
        })
        .map(resolved)
}

fn match_by_display_name(nodes: &[Node], descriptor: &EntityDescriptor) -> Option<ResolvedNode> {
    if descriptor.display_name.is_empty() {
        return None;
    }
    nodes
        .iter()
        .find(|n| n.metadata.name.as_deref() == Some(descriptor.display_name.as_str()))
        .map(resolved)
}

fn match_by_ip(nodes: &[Node], descriptor: &EntityDescriptor) -> Option<ResolvedNode> {
    if descriptor.ip_addresses.is_empty() {
        return None;
    }
    nodes
        .iter()
        .find(|n| {
            n.status
                .as_ref()
                .and_then(|s| s.addresses.as_ref())
                .map(|addresses| {
                    addresses
                        .iter()
                        .any(|a| descriptor.ip_addresses.iter().any(|ip| *ip == a.address))
                })
                .unwrap_or(false)
        })
        .map(resolved)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::NodeAddress;
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::api::core::v1::NodeSystemInfo;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::super::types::DescriptorProperty;
    use super::*;

    fn node(name: &str, uuid: &str, ips: &[&str]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some(format!("uid-{name}")),
                ..Default::default()
            },
            status: Some(NodeStatus {
                node_info: Some(NodeSystemInfo {
                    system_uuid: uuid.to_string(),
                    ..Default::default()
                }),
                addresses: Some(
                    ips.iter()
                        .map(|ip| NodeAddress {
                            address: ip.to_string(),
                            type_: "InternalIP".to_string(),
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn uuid_match_wins_over_name_and_ip_conflicts() {
        let nodes = vec![
            node("n1", "aaaa-bbbb", &["10.0.0.1"]),
            node("n2", "cccc-dddd", &["10.0.0.2"]),
        ];
        // The descriptor's display name and IP point at n2, but the UUID
        // identifies n1.
        let descriptor = EntityDescriptor {
            uuid: "AAAA-BBBB".to_string(),
            display_name: "n2".to_string(),
            ip_addresses: vec!["10.0.0.2".to_string()],
            ..Default::default()
        };

        let matched = match_by_uuid(&nodes, &descriptor).unwrap();
        assert_eq!(matched.name, "n1");
        assert_eq!(matched.cluster, None);
    }

    #[test]
    fn node_name_property_is_checked_first() {
        let nodes = vec![node("n1", "u1", &[]), node("n2", "u2", &[])];
        let descriptor = EntityDescriptor {
            properties: vec![DescriptorProperty {
                name: PROP_NODE_NAME.to_string(),
                value: "n2".to_string(),
            }],
            ..Default::default()
        };
        assert_eq!(match_by_property(&nodes, &descriptor).unwrap().name, "n2");
    }

    #[test]
    fn display_name_and_ip_are_fallbacks() {
        let nodes = vec![node("n1", "u1", &["10.0.0.1"])];

        let by_name = EntityDescriptor {
            display_name: "n1".to_string(),
            ..Default::default()
        };
        assert!(match_by_display_name(&nodes, &by_name).is_some());

        let by_ip = EntityDescriptor {
            ip_addresses: vec!["10.0.0.1".to_string(), "192.168.0.9".to_string()],
            ..Default::default()
        };
        assert!(match_by_ip(&nodes, &by_ip).is_some());

        let miss = EntityDescriptor {
            display_name: "other".to_string(),
            ip_addresses: vec!["172.16.0.1".to_string()],
            ..Default::default()
        };
        assert!(match_by_display_name(&nodes, &miss).is_none());
        assert!(match_by_ip(&nodes, &miss).is_none());
    }

    #[test]
    fn empty_descriptor_fields_never_match() {
        let nodes = vec![node("n1", "", &[])];
        let empty = EntityDescriptor::default();
        assert!(match_by_property(&nodes, &empty).is_none());
        assert!(match_by_uuid(&nodes, &empty).is_none());
        assert!(match_by_display_name(&nodes, &empty).is_none());
        assert!(match_by_ip(&nodes, &empty).is_none());
    }
}
