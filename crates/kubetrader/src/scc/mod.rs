//! OpenShift SCC bootstrap.
//!
//! To restart pods under their original security context constraints,
//! one service account per SCC is created and inserted into the SCC's
//! user list, with a shared role/rolebinding granting pod access. The
//! SCC-to-service-account mapping is owned by this component and only
//! mutated during bootstrap and teardown. Names are deterministic, so a
//! leaked resource is adopted (or cleaned up by namespace deletion) on
//! the next run.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use k8s_openapi::api::authorization::v1::ResourceAttributes;
use k8s_openapi::api::authorization::v1::SelfSubjectAccessReview;
use k8s_openapi::api::authorization::v1::SelfSubjectAccessReviewSpec;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::PolicyRule;
use k8s_openapi::api::rbac::v1::Role;
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::api::rbac::v1::RoleRef;
use k8s_openapi::api::rbac::v1::Subject;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::ApiResource;
use kube::api::DeleteParams;
use kube::api::DynamicObject;
use kube::api::GroupVersionKind;
use kube::api::ListParams;
use kube::api::PostParams;
use kube::Api;
use kube::ResourceExt;
use tracing::error;
use tracing::info;
use tracing::warn;
use utils::retry_during;

const NAMESPACE_ENV_VAR: &str = "KUBETURBO_NAMESPACE";
const DEFAULT_NAMESPACE: &str = "default";

// Deterministic names so resources can be identified across restarts.
const SCC_PREFIX: &str = "kubeturbo-scc-";
const SCC_ROLE_NAME: &str = "kubeturbo-scc-pod-restart-role";
const SCC_ROLE_BINDING_NAME: &str = "kubeturbo-scc-pod-restart-rolebinding";

const OPENSHIFT_SECURITY_GROUP: &str = "security.openshift.io";
const SCC_RESOURCE: &str = "securitycontextconstraints";

const RETRY_ATTEMPTS: usize = 5;
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// The namespace SCC bootstrap resources are created in.
pub fn agent_namespace() -> String {
    std::env::var(NAMESPACE_ENV_VAR).unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string())
}

pub struct SccManager {
    client: kube::Client,
    namespace: String,
    mapping: Mutex<HashMap<String, String>>,
}

impl SccManager {
    pub fn new(client: kube::Client, namespace: String) -> Self {
        Self {
            client,
            namespace,
            mapping: Mutex::new(HashMap::new()),
        }
    }

    /// The service account impersonated for pods requiring `scc_name`.
    pub fn service_account_for(&self, scc_name: &str) -> Option<String> {
        self.mapping
            .lock()
            .expect("poisoned")
            .get(scc_name)
            .cloned()
    }

    fn scc_api(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(OPENSHIFT_SECURITY_GROUP, "v1", "SecurityContextConstraints");
        let ar = ApiResource::from_gvk_with_plural(&gvk, SCC_RESOURCE);
        Api::all_with(self.client.clone(), &ar)
    }

    /// Best-effort bootstrap. A cluster without SCCs (vanilla
    /// Kubernetes) is a no-op; a partial failure tears the created
    /// resources down again.
    pub async fn bootstrap(&self) {
        if !self.review_access().await {
            return;
        }

        let scc_names = match self.list_scc_names().await {
            Some(names) if !names.is_empty() => names,
            _ => return,
        };
        info!(
            sccs = scc_names.len(),
            "openshift cluster detected, bootstrapping SCC service accounts"
        );

        let mut sa_names = Vec::new();
        for scc_name in &scc_names {
            let sa_name = match self.create_service_account(scc_name).await {
                Ok(name) => name,
                Err(e) => {
                    error!(scc = %scc_name, "aborting SCC bootstrap: {e}");
                    self.teardown().await;
                    return;
                }
            };
            if let Err(e) = self
                .update_scc_users(scc_name, |users| {
                    add_user(users, &user_full_name(&self.namespace, &sa_name))
                })
                .await
            {
                error!(scc = %scc_name, "aborting SCC bootstrap: {e}");
                self.teardown().await;
                return;
            }

            sa_names.push(sa_name.clone());
            self.mapping
                .lock()
                .expect("poisoned")
                .insert(scc_name.clone(), sa_name);
        }

        if let Err(e) = self.create_role().await {
            error!("aborting SCC bootstrap: {e}");
            self.teardown().await;
            return;
        }
        if let Err(e) = self.create_role_binding(&sa_names).await {
            error!("aborting SCC bootstrap: {e}");
            self.teardown().await;
            return;
        }

        info!("SCC bootstrap complete");
    }

    /// Idempotent cleanup of everything bootstrap created. Failures are
    /// logged and tolerated; leaked resources disappear with the
    /// namespace.
    pub async fn teardown(&self) {
        let mapping = std::mem::take(&mut *self.mapping.lock().expect("poisoned"));
        if mapping.is_empty() {
            info!("SCC resource cleanup is not needed");
            return;
        }
        info!("SCC resource cleanup started");

        let sa_api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &self.namespace);
        for (scc_name, sa_name) in &mapping {
            if let Err(e) = self
                .update_scc_users(scc_name, |users| {
                    remove_user(users, &user_full_name(&self.namespace, sa_name))
                })
                .await
            {
                warn!(scc = %scc_name, "failed to remove SCC user: {e}");
            }

            let result = retry_during(RETRY_ATTEMPTS, Duration::ZERO, RETRY_INTERVAL, || async {
                match sa_api.delete(sa_name, &DeleteParams::default()).await {
                    Ok(_) => Ok(()),
                    Err(e) if is_not_found(&e) => Ok(()),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await;
            if let Err(e) = result {
                warn!(sa = %sa_name, "failed to delete SCC service account: {e}");
            }
        }

        let rb_api: Api<RoleBinding> = Api::namespaced(self.client.clone(), &self.namespace);
        if let Err(e) = rb_api
            .delete(SCC_ROLE_BINDING_NAME, &DeleteParams::default())
            .await
        {
            if !is_not_found(&e) {
                warn!("failed to delete SCC role binding: {e}");
            }
        }
        let role_api: Api<Role> = Api::namespaced(self.client.clone(), &self.namespace);
        if let Err(e) = role_api.delete(SCC_ROLE_NAME, &DeleteParams::default()).await {
            if !is_not_found(&e) {
                warn!("failed to delete SCC role: {e}");
            }
        }

        info!("SCC resource cleanup completed");
    }

    /// Verifies the permissions the bootstrap needs: update SCCs, create
    /// service accounts, roles and rolebindings, and impersonate.
    async fn review_access(&self) -> bool {
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        for attributes in required_permissions(&self.namespace) {
            let review = SelfSubjectAccessReview {
                metadata: ObjectMeta::default(),
                spec: SelfSubjectAccessReviewSpec {
                    resource_attributes: Some(attributes.clone()),
                    ..Default::default()
                },
                status: None,
            };
            match api.create(&PostParams::default(), &review).await {
                Ok(result) => {
                    let allowed = result.status.map(|s| s.allowed).unwrap_or(false);
                    if !allowed {
                        error!(
                            verb = ?attributes.verb,
                            resource = ?attributes.resource,
                            "missing permission; SCC levels will not be used for pod restarts"
                        );
                        return false;
                    }
                }
                Err(e) => {
                    error!("error reviewing SCC permissions: {e}");
                    return false;
                }
            }
        }
        true
    }

    async fn list_scc_names(&self) -> Option<Vec<String>> {
        let api = self.scc_api();
        let result = retry_during(RETRY_ATTEMPTS, Duration::ZERO, RETRY_INTERVAL, || async {
            api.list(&ListParams::default())
                .await
                .map_err(|e| e.to_string())
        })
        .await;

        match result {
            Ok(list) => Some(list.items.iter().map(|scc| scc.name_any()).collect()),
            Err(e) => {
                // Most likely not an openshift cluster.
                info!("skipping SCC management: {e}");
                None
            }
        }
    }

    async fn create_service_account(&self, scc_name: &str) -> Result<String, String> {
        let sa_name = format!("{SCC_PREFIX}{scc_name}");
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &self.namespace);
        let sa = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(sa_name.clone()),
                ..Default::default()
            },
            ..Default::default()
        };

        retry_during(RETRY_ATTEMPTS, Duration::ZERO, RETRY_INTERVAL, || async {
            match api.create(&PostParams::default(), &sa).await {
                Ok(_) => Ok(()),
                Err(e) if is_already_exists(&e) => Ok(()),
                Err(e) => Err(e.to_string()),
            }
        })
        .await
        .map_err(|e| e.to_string())?;

        Ok(sa_name)
    }

    /// Reads the SCC, applies `mutate` to its user list and writes it
    /// back. A `false` from `mutate` means no update is needed.
    async fn update_scc_users(
        &self,
        scc_name: &str,
        mutate: impl Fn(&mut Vec<String>) -> bool,
    ) -> Result<(), String> {
        let api = self.scc_api();

        let mut scc = retry_during(RETRY_ATTEMPTS, Duration::ZERO, RETRY_INTERVAL, || async {
            api.get(scc_name).await.map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| e.to_string())?;

        let mut users: Vec<String> = scc
            .data
            .get("users")
            .and_then(|u| u.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        if !mutate(&mut users) {
            return Ok(());
        }
        scc.data["users"] = serde_json::json!(users);

        retry_during(RETRY_ATTEMPTS, Duration::ZERO, RETRY_INTERVAL, || {
            let scc = scc.clone();
            let api = api.clone();
            async move {
                api.replace(scc_name, &PostParams::default(), &scc)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
        })
        .await
        .map_err(|e| e.to_string())
    }

    async fn create_role(&self) -> Result<(), String> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), &self.namespace);
        let role = Role {
            metadata: ObjectMeta {
                name: Some(SCC_ROLE_NAME.to_string()),
                ..Default::default()
            },
            rules: Some(vec![PolicyRule {
                verbs: vec!["*".to_string()],
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["pods".to_string()]),
                ..Default::default()
            }]),
        };

        retry_during(RETRY_ATTEMPTS, Duration::ZERO, RETRY_INTERVAL, || async {
            match api.create(&PostParams::default(), &role).await {
                Ok(_) => Ok(()),
                Err(e) if is_already_exists(&e) => Ok(()),
                Err(e) => Err(e.to_string()),
            }
        })
        .await
        .map_err(|e| e.to_string())
    }

    async fn create_role_binding(&self, sa_names: &[String]) -> Result<(), String> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), &self.namespace);
        let binding = RoleBinding {
            metadata: ObjectMeta {
                name: Some(SCC_ROLE_BINDING_NAME.to_string()),
                ..Default::default()
            },
            subjects: Some(
                sa_names
                    .iter()
                    .map(|name| Subject {
                        kind: "ServiceAccount".to_string(),
                        name: name.clone(),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: SCC_ROLE_NAME.to_string(),
            },
        };

        retry_during(RETRY_ATTEMPTS, Duration::ZERO, RETRY_INTERVAL, || async {
            match api.create(&PostParams::default(), &binding).await {
                Ok(_) => Ok(()),
                Err(e) if is_already_exists(&e) => Ok(()),
                Err(e) => Err(e.to_string()),
            }
        })
        .await
        .map_err(|e| e.to_string())
    }
}

fn required_permissions(namespace: &str) -> Vec<ResourceAttributes> {
    vec![
        ResourceAttributes {
            group: Some(OPENSHIFT_SECURITY_GROUP.to_string()),
            resource: Some(SCC_RESOURCE.to_string()),
            verb: Some("update".to_string()),
            ..Default::default()
        },
        ResourceAttributes {
            resource: Some("serviceaccounts".to_string()),
            verb: Some("create".to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ResourceAttributes {
            group: Some("rbac.authorization.k8s.io".to_string()),
            resource: Some("roles".to_string()),
            verb: Some("create".to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ResourceAttributes {
            group: Some("rbac.authorization.k8s.io".to_string()),
            resource: Some("rolebindings".to_string()),
            verb: Some("create".to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ResourceAttributes {
            group: Some("rbac.authorization.k8s.io".to_string()),
            resource: Some("rolebindings".to_string()),
            verb: Some("update".to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ResourceAttributes {
            group: Some("rbac.authorization.k8s.io".to_string()),
            resource: Some("serviceaccounts".to_string()),
            verb: Some("impersonate".to_string()),
            ..Default::default()
        },
    ]
}

fn user_full_name(namespace: &str, sa_name: &str) -> String {
    format!("system:serviceaccount:{namespace}:{sa_name}")
}

/// Adds the user unless present; returns whether the list changed.
fn add_user(users: &mut Vec<String>, user: &str) -> bool {
    if users.iter().any(|u| u == user) {
        return false;
    }
    users.push(user.to_string());
    true
}

/// Removes the user if present; returns whether the list changed.
fn remove_user(users: &mut Vec<String>, user: &str) -> bool {
    let before = users.len();
    users.retain(|u| u != user);
    users.len() != before
}

fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_list_mutations_are_idempotent() {
        let mut users = vec!["system:serviceaccount:turbo:existing".to_string()];
        let user = user_full_name("turbo", "kubeturbo-scc-restricted");

        assert!(add_user(&mut users, &user));
        assert!(!add_user(&mut users, &user));
        assert_eq!(users.len(), 2);

        assert!(remove_user(&mut users, &user));
        assert!(!remove_user(&mut users, &user));
        assert_eq!(users.len(), 1);
    }

    #[test]
    fn service_account_user_names_are_fully_qualified() {
        assert_eq!(
            user_full_name("turbo", "kubeturbo-scc-anyuid"),
            "system:serviceaccount:turbo:kubeturbo-scc-anyuid"
        );
    }

    #[test]
    fn namespace_falls_back_to_default() {
        // The env var is unset in tests.
        if std::env::var(NAMESPACE_ENV_VAR).is_err() {
            assert_eq!(agent_namespace(), DEFAULT_NAMESPACE);
        }
    }
}
