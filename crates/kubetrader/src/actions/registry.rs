//! Executor registry and the action dispatch loop.
//!
//! Incoming action items are routed by `(action type, target entity
//! kind)`; every executor shares the same input/output contract and the
//! outcome is reported back to the market. Nothing here retries a failed
//! action; the market owns retries.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::types::ActionError;
use super::types::ActionItem;
use super::types::ActionOutcome;
use super::types::ActionSuccess;
use super::types::ActionType;
use crate::market::MarketTransport;
use crate::metrics::EntityKind;

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        item: &ActionItem,
        cancel: &CancellationToken,
    ) -> Result<ActionSuccess, Report<ActionError>>;
}

#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<(ActionType, EntityKind), Arc<dyn ActionExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        action_type: ActionType,
        target_kind: EntityKind,
        executor: Arc<dyn ActionExecutor>,
    ) -> &mut Self {
        self.executors.insert((action_type, target_kind), executor);
        self
    }

    /// Routes one action item to its executor and folds the result into
    /// the market-facing outcome.
    pub async fn dispatch(&self, item: &ActionItem, cancel: &CancellationToken) -> ActionOutcome {
        let Some(target_kind) = item.target.entity_kind else {
            let err = ActionError::Unsupported {
                action_type: item.action_type,
                target_kind: None,
            };
            return ActionOutcome::failure(item.id, err.to_string());
        };

        let Some(executor) = self.executors.get(&(item.action_type, target_kind)) else {
            let err = ActionError::Unsupported {
                action_type: item.action_type,
                target_kind: Some(target_kind),
            };
            return ActionOutcome::failure(item.id, err.to_string());
        };

        match executor.execute(item, cancel).await {
            Ok(result) => ActionOutcome::success(item.id, &result),
            Err(e) => ActionOutcome::failure(item.id, format!("{e:?}")),
        }
    }
}

/// Consumes the market's action stream until cancellation, reporting
/// every outcome through the transport.
pub async fn run_dispatcher(
    registry: Arc<ExecutorRegistry>,
    mut actions: mpsc::Receiver<ActionItem>,
    transport: Arc<dyn MarketTransport>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            item = actions.recv() => {
                match item {
                    Some(item) => {
                        info!(action_id = item.id, action_type = ?item.action_type, "executing action");
                        let outcome = registry.dispatch(&item, &cancel).await;
                        if !outcome.succeeded {
                            error!(action_id = item.id, "action failed: {}", outcome.message);
                        }
                        if let Err(e) = transport.report_outcome(&outcome).await {
                            error!(action_id = item.id, "failed to report action outcome: {e:#}");
                        }
                    }
                    None => {
                        info!("action stream closed");
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                info!("action dispatcher cancelled");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::EntityDescriptor;
    use super::*;

    struct FixedExecutor {
        result: &'static str,
    }

    #[async_trait]
    impl ActionExecutor for FixedExecutor {
        async fn execute(
            &self,
            _item: &ActionItem,
            _cancel: &CancellationToken,
        ) -> Result<ActionSuccess, Report<ActionError>> {
            match self.result {
                "ok" => Ok(ActionSuccess::PodMoved {
                    old_pod: "a".to_string(),
                    new_pod: "b".to_string(),
                }),
                _ => Err(Report::new(ActionError::ExecutionFailed {
                    message: "nope".to_string(),
                })),
            }
        }
    }

    fn item(action_type: ActionType, kind: Option<EntityKind>) -> ActionItem {
        ActionItem {
            id: 1,
            action_type,
            target: EntityDescriptor {
                entity_kind: kind,
                ..Default::default()
            },
            new_host: None,
            new_capacity: None,
        }
    }

    #[tokio::test]
    async fn dispatch_routes_by_action_and_target_kind() {
        let mut registry = ExecutorRegistry::new();
        registry.register(
            ActionType::Move,
            EntityKind::Pod,
            Arc::new(FixedExecutor { result: "ok" }),
        );
        let cancel = CancellationToken::new();

        let outcome = registry
            .dispatch(&item(ActionType::Move, Some(EntityKind::Pod)), &cancel)
            .await;
        assert!(outcome.succeeded);
        assert_eq!(outcome.new_pod.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn unregistered_combinations_are_unsupported() {
        let registry = ExecutorRegistry::new();
        let cancel = CancellationToken::new();

        let outcome = registry
            .dispatch(&item(ActionType::Resize, Some(EntityKind::Container)), &cancel)
            .await;
        assert!(!outcome.succeeded);
        assert!(outcome.message.contains("no executor registered"));

        let outcome = registry
            .dispatch(&item(ActionType::Move, None), &cancel)
            .await;
        assert!(!outcome.succeeded);
    }

    #[tokio::test]
    async fn executor_errors_become_failed_outcomes() {
        let mut registry = ExecutorRegistry::new();
        registry.register(
            ActionType::Move,
            EntityKind::Pod,
            Arc::new(FixedExecutor { result: "err" }),
        );
        let cancel = CancellationToken::new();

        let outcome = registry
            .dispatch(&item(ActionType::Move, Some(EntityKind::Pod)), &cancel)
            .await;
        assert!(!outcome.succeeded);
        assert!(outcome.message.contains("nope"));
    }
}
