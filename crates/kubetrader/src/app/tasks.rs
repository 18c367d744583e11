//! Task manager: spawns the long-running services under one
//! cancellation token and handles signal-driven graceful teardown.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::actions::run_dispatcher;
use crate::actions::ActionItem;
use crate::app::core::Application;
use crate::server::AdminServer;

/// The default container termination grace window; cleanup must fit
/// inside it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

type CleanupFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

pub struct Tasks {
    tasks: Vec<JoinHandle<()>>,
    cleanups: Vec<CleanupFn>,
    cancellation_token: CancellationToken,
    /// Keeps the action channel open for the lifetime of the process;
    /// the market transport feeds action items through this sender.
    action_sender: Option<mpsc::Sender<ActionItem>>,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cleanups: Vec::new(),
            cancellation_token: CancellationToken::new(),
            action_sender: None,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// The inbound end of the market action stream.
    pub fn action_sender(&self) -> Option<mpsc::Sender<ActionItem>> {
        self.action_sender.clone()
    }

    /// Registers a cleanup function run concurrently with the others at
    /// shutdown. Cleanups must be idempotent.
    pub fn register_cleanup<F, Fut>(&mut self, cleanup: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cleanups.push(Box::new(move || Box::pin(cleanup())));
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        // Discovery orchestrator task
        let orchestrator_task = {
            let orchestrator = app.services().orchestrator.clone();
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("Starting discovery orchestrator task");
                orchestrator.run(token).await;
                tracing::info!("Discovery orchestrator task completed");
            })
        };
        self.tasks.push(orchestrator_task);

        // Action dispatcher task
        let (action_sender, action_receiver) = mpsc::channel::<ActionItem>(32);
        self.action_sender = Some(action_sender);
        let dispatcher_task = {
            let registry = app.services().registry.clone();
            let transport = app.services().transport.clone();
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("Starting action dispatcher task");
                run_dispatcher(registry, action_receiver, transport, token).await;
                tracing::info!("Action dispatcher task completed");
            })
        };
        self.tasks.push(dispatcher_task);

        // Admin HTTP server task
        let admin_task = {
            let server = AdminServer::new(
                app.args().admin_listen_addr(),
                app.services().discovery_status.clone(),
            );
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                server.run(token).await;
            })
        };
        self.tasks.push(admin_task);

        Ok(())
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;
                let mut sigquit = signal(SignalKind::quit())?;
                let mut sighup = signal(SignalKind::hangup())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
                        _ = sigint.recv() => tracing::info!("Received SIGINT, initiating graceful shutdown"),
                        _ = sigquit.recv() => tracing::info!("Received SIGQUIT, initiating graceful shutdown"),
                        _ = sighup.recv() => tracing::info!("Received SIGHUP, initiating graceful shutdown"),
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    tokio::signal::ctrl_c()
                        .await
                        .expect("Failed to install Ctrl+C handler");
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();
                self.run_cleanups().await;
                self.wait_for_tasks_with_timeout(SHUTDOWN_GRACE).await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    self.cancellation_token.cancel();
                    self.run_cleanups().await;
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
                self.cancellation_token.cancel();
                self.run_cleanups().await;
            }
        }

        Ok(())
    }

    /// Fans the registered cleanup functions out concurrently and waits
    /// for all of them within the grace window.
    async fn run_cleanups(&mut self) {
        let cleanups: Vec<CleanupFn> = std::mem::take(&mut self.cleanups);
        if cleanups.is_empty() {
            return;
        }

        let all = join_all(cleanups.into_iter().map(|cleanup| cleanup()));
        if tokio::time::timeout(SHUTDOWN_GRACE, all).await.is_err() {
            tracing::warn!("cleanup did not finish within {SHUTDOWN_GRACE:?}");
        }
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn cleanups_run_concurrently_and_are_awaited() {
        let mut tasks = Tasks::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            tasks.register_cleanup(move || async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        tasks.run_cleanups().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        // A second run is a no-op: cleanups were consumed.
        tasks.run_cleanups().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
