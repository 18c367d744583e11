//! Provision / suspend executors: scale a workload controller's replica
//! count up or down by one.

use async_trait::async_trait;
use error_stack::Report;
use kube::api::PostParams;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::registry::ActionExecutor;
use super::types::ActionError;
use super::types::ActionItem;
use super::types::ActionSuccess;
use super::types::PROP_CONTROLLER_KIND;
use super::types::PROP_NAMESPACE;
use super::workload::controller_api;
use crate::cluster::groups::ControllerGroupVersions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDirection {
    /// Provision: one replica more.
    Up,
    /// Suspend: one replica less.
    Down,
}

pub struct ScaleExecutor {
    client: kube::Client,
    groups: ControllerGroupVersions,
    direction: ScaleDirection,
}

impl ScaleExecutor {
    pub fn new(
        client: kube::Client,
        groups: ControllerGroupVersions,
        direction: ScaleDirection,
    ) -> Self {
        Self {
            client,
            groups,
            direction,
        }
    }
}

#[async_trait]
impl ActionExecutor for ScaleExecutor {
    async fn execute(
        &self,
        item: &ActionItem,
        _cancel: &CancellationToken,
    ) -> Result<ActionSuccess, Report<ActionError>> {
        let kind = item
            .target
            .property(PROP_CONTROLLER_KIND)
            .ok_or_else(|| {
                Report::new(ActionError::ResolutionFailed {
                    message: "scale target does not carry a controller kind".to_string(),
                })
            })?
            .to_string();

        let (namespace, name) = match item.target.property(PROP_NAMESPACE) {
            Some(namespace) => (
                namespace.to_string(),
                item.target.display_name.clone(),
            ),
            None => item.target.namespaced_name().ok_or_else(|| {
                Report::new(ActionError::ResolutionFailed {
                    message: "scale target does not identify a controller".to_string(),
                })
            })?,
        };

        let api = controller_api(self.client.clone(), &self.groups, &kind, &namespace)
            .map_err(Report::new)?;
        let mut controller = api.get(&name).await.map_err(|e| {
            Report::new(ActionError::ResolutionFailed {
                message: format!("{kind} {namespace}/{name} not found: {e}"),
            })
        })?;

        let current = controller
            .data
            .pointer("/spec/replicas")
            .and_then(|r| r.as_i64())
            .unwrap_or(1) as i32;
        let target = next_replica_count(current, self.direction).map_err(Report::new)?;

        if let Some(spec) = controller
            .data
            .pointer_mut("/spec")
            .and_then(|s| s.as_object_mut())
        {
            spec.insert("replicas".to_string(), serde_json::json!(target));
        } else {
            return Err(Report::new(ActionError::ExecutionFailed {
                message: format!("{kind} {namespace}/{name} has no spec"),
            }));
        }

        api.replace(&name, &PostParams::default(), &controller)
            .await
            .map_err(|e| {
                Report::new(ActionError::ExecutionFailed {
                    message: format!("scaling {kind} {namespace}/{name} failed: {e}"),
                })
            })?;

        info!(
            controller = %name,
            from = current,
            to = target,
            "workload controller scaled"
        );
        Ok(ActionSuccess::Scaled {
            controller: format!("{namespace}/{name}"),
            replicas: target,
        })
    }
}

fn next_replica_count(current: i32, direction: ScaleDirection) -> Result<i32, ActionError> {
    match direction {
        ScaleDirection::Up => Ok(current + 1),
        ScaleDirection::Down if current > 0 => Ok(current - 1),
        ScaleDirection::Down => Err(ActionError::PreCheckFailed {
            message: "controller is already scaled to zero".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaling_moves_one_step() {
        assert_eq!(next_replica_count(2, ScaleDirection::Up).unwrap(), 3);
        assert_eq!(next_replica_count(2, ScaleDirection::Down).unwrap(), 1);
        assert_eq!(next_replica_count(0, ScaleDirection::Up).unwrap(), 1);
    }

    #[test]
    fn suspend_at_zero_is_rejected() {
        assert!(next_replica_count(0, ScaleDirection::Down).is_err());
    }
}
