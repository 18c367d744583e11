//! Dynamic-API access to workload controllers under their discovered
//! group/versions.

use kube::api::ApiResource;
use kube::api::DynamicObject;
use kube::api::GroupVersionKind;
use kube::Api;

use super::types::ActionError;
use crate::cluster::groups::ControllerGroupVersions;
use crate::cluster::groups::KIND_CRON_JOB;
use crate::cluster::groups::KIND_DAEMON_SET;
use crate::cluster::groups::KIND_DEPLOYMENT;
use crate::cluster::groups::KIND_DEPLOYMENT_CONFIG;
use crate::cluster::groups::KIND_JOB;
use crate::cluster::groups::KIND_REPLICA_SET;
use crate::cluster::groups::KIND_REPLICATION_CONTROLLER;
use crate::cluster::groups::KIND_STATEFUL_SET;
use crate::cluster::groups::OPENSHIFT_APPS_GROUP;

/// Maps a controller kind to the group/version it is served under.
/// Deployments and replicasets use the discovered preference; the other
/// kinds are stable.
pub fn controller_gvk(
    kind: &str,
    groups: &ControllerGroupVersions,
) -> Result<GroupVersionKind, ActionError> {
    let (group, version) = match kind {
        KIND_DEPLOYMENT => (groups.deployment.0.as_str(), groups.deployment.1.as_str()),
        KIND_REPLICA_SET => (groups.replicaset.0.as_str(), groups.replicaset.1.as_str()),
        KIND_STATEFUL_SET | KIND_DAEMON_SET => ("apps", "v1"),
        KIND_JOB | KIND_CRON_JOB => ("batch", "v1"),
        KIND_REPLICATION_CONTROLLER => ("", "v1"),
        KIND_DEPLOYMENT_CONFIG => (OPENSHIFT_APPS_GROUP, "v1"),
        other => {
            return Err(ActionError::ExecutionFailed {
                message: format!("controller kind {other} cannot be accessed dynamically"),
            })
        }
    };
    Ok(GroupVersionKind::gvk(group, version, kind))
}

pub fn controller_api(
    client: kube::Client,
    groups: &ControllerGroupVersions,
    kind: &str,
    namespace: &str,
) -> Result<Api<DynamicObject>, ActionError> {
    let gvk = controller_gvk(kind, groups)?;
    let ar = ApiResource::from_gvk(&gvk);
    Ok(Api::namespaced_with(client, namespace, &ar))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovered_group_versions_apply_to_deployments() {
        let mut groups = ControllerGroupVersions::default();
        groups.deployment = ("extensions".to_string(), "v1beta1".to_string());

        let gvk = controller_gvk(KIND_DEPLOYMENT, &groups).unwrap();
        assert_eq!(gvk.group, "extensions");
        assert_eq!(gvk.version, "v1beta1");

        let gvk = controller_gvk(KIND_STATEFUL_SET, &groups).unwrap();
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
    }

    #[test]
    fn replication_controllers_live_in_the_core_group() {
        let groups = ControllerGroupVersions::default();
        let gvk = controller_gvk(KIND_REPLICATION_CONTROLLER, &groups).unwrap();
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        let groups = ControllerGroupVersions::default();
        assert!(controller_gvk("Whatever", &groups).is_err());
    }
}
