//! Workload controller kinds and API group/version discovery.
//!
//! The group/version serving deployments and replicasets differs across
//! cluster versions; it is discovered once at startup from the server's
//! advertised resources, preferring `apps` over `extensions` and
//! ordering versions the Kubernetes-aware way.

use std::cmp::Ordering;

use anyhow::Context;
use tracing::debug;
use tracing::warn;
use utils::compare_kube_aware_versions;

pub const KIND_CRON_JOB: &str = "CronJob";
pub const KIND_DAEMON_SET: &str = "DaemonSet";
pub const KIND_DEPLOYMENT: &str = "Deployment";
pub const KIND_DEPLOYMENT_CONFIG: &str = "DeploymentConfig";
pub const KIND_JOB: &str = "Job";
pub const KIND_REPLICA_SET: &str = "ReplicaSet";
pub const KIND_REPLICATION_CONTROLLER: &str = "ReplicationController";
pub const KIND_STATEFUL_SET: &str = "StatefulSet";

pub const APPS_GROUP: &str = "apps";
pub const EXTENSIONS_GROUP: &str = "extensions";
pub const OPENSHIFT_APPS_GROUP: &str = "apps.openshift.io";

pub const DEPLOYMENT_RESOURCE: &str = "deployments";
pub const REPLICASET_RESOURCE: &str = "replicasets";

/// The default when discovery cannot reach the server.
pub const DEFAULT_APPS_GROUP_VERSION: (&str, &str) = (APPS_GROUP, "v1");

/// The discovered group/versions used for dynamic controller access.
#[derive(Debug, Clone)]
pub struct ControllerGroupVersions {
    pub deployment: (String, String),
    pub replicaset: (String, String),
}

impl Default for ControllerGroupVersions {
    fn default() -> Self {
        let (g, v) = DEFAULT_APPS_GROUP_VERSION;
        Self {
            deployment: (g.to_string(), v.to_string()),
            replicaset: (g.to_string(), v.to_string()),
        }
    }
}

impl ControllerGroupVersions {
    pub async fn discover(client: &kube::Client) -> Self {
        let deployment = discover_resource_group_version(client, DEPLOYMENT_RESOURCE)
            .await
            .unwrap_or_else(|e| {
                warn!("failed to discover deployment group/version: {e:#}");
                tuple_strings(DEFAULT_APPS_GROUP_VERSION)
            });
        let replicaset = discover_resource_group_version(client, REPLICASET_RESOURCE)
            .await
            .unwrap_or_else(|e| {
                warn!("failed to discover replicaset group/version: {e:#}");
                tuple_strings(DEFAULT_APPS_GROUP_VERSION)
            });

        debug!(?deployment, ?replicaset, "discovered controller group/versions");
        Self {
            deployment,
            replicaset,
        }
    }
}

fn tuple_strings((g, v): (&str, &str)) -> (String, String) {
    (g.to_string(), v.to_string())
}

/// Queries the server's advertised API resources and returns the
/// preferred group/version under which `resource_name` is served.
async fn discover_resource_group_version(
    client: &kube::Client,
    resource_name: &str,
) -> anyhow::Result<(String, String)> {
    let groups = client
        .list_api_groups()
        .await
        .context("listing api groups")?;

    let mut candidates = Vec::new();
    for group in groups.groups {
        if group.name != APPS_GROUP && group.name != EXTENSIONS_GROUP {
            continue;
        }
        for gv in &group.versions {
            let resources = match client.list_api_group_resources(&gv.group_version).await {
                Ok(list) => list,
                Err(e) => {
                    warn!(
                        group_version = %gv.group_version,
                        "error listing api resources: {e}"
                    );
                    continue;
                }
            };
            if resources.resources.iter().any(|r| r.name == resource_name) {
                candidates.push((group.name.clone(), gv.version.clone()));
            }
        }
    }

    Ok(select_preferred_group_version(&candidates)
        .unwrap_or_else(|| tuple_strings(DEFAULT_APPS_GROUP_VERSION)))
}

/// Picks the group/version to use: `apps` beats `extensions`, and within
/// a group the Kubernetes-aware latest version wins.
pub fn select_preferred_group_version(
    candidates: &[(String, String)],
) -> Option<(String, String)> {
    let mut latest_apps: Option<&str> = None;
    let mut latest_extensions: Option<&str> = None;

    for (group, version) in candidates {
        let slot = match group.as_str() {
            APPS_GROUP => &mut latest_apps,
            EXTENSIONS_GROUP => &mut latest_extensions,
            _ => continue,
        };
        match slot {
            Some(existing)
                if compare_kube_aware_versions(version, existing) != Ordering::Greater => {}
            _ => *slot = Some(version),
        }
    }

    if let Some(version) = latest_apps {
        return Some((APPS_GROUP.to_string(), version.to_string()));
    }
    latest_extensions.map(|version| (EXTENSIONS_GROUP.to_string(), version.to_string()))
}
