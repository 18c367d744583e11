//! Bounded worker pool with a completion barrier.
//!
//! Sampling sub-cycles dispatch one task per node onto a fixed pool;
//! the round only advances once every worker has drained the queue (or
//! hit its per-task timeout). Cancellation is cooperative: running tasks
//! finish, no new task is started after cancel.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub completed: usize,
    pub failed: usize,
    /// Tasks never started because of cancellation.
    pub skipped: usize,
}

/// Runs every task through a pool of at most `workers` concurrent
/// executions and waits for all of them (barrier). A task failure or
/// timeout is counted, logged by the caller-supplied description, and
/// never fails the round.
pub async fn run_worker_pool<T, F, Fut>(
    tasks: Vec<T>,
    workers: usize,
    per_task_timeout: Duration,
    cancel: &CancellationToken,
    describe: fn(&T) -> String,
    run: F,
) -> PoolStats
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<(), String>> + Send,
{
    let total = tasks.len();
    let queue = Arc::new(Mutex::new(tasks.into_iter().collect::<VecDeque<T>>()));
    let completed = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..workers.max(1) {
        let queue = Arc::clone(&queue);
        let completed = Arc::clone(&completed);
        let failed = Arc::clone(&failed);
        let cancel = cancel.clone();
        let run = run.clone();

        handles.push(tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let task = queue.lock().expect("poisoned").pop_front();
                let Some(task) = task else { break };
                let name = describe(&task);

                match tokio::time::timeout(per_task_timeout, run(task)).await {
                    Ok(Ok(())) => {
                        completed.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(Err(e)) => {
                        warn!(task = %name, "worker task failed: {e}");
                        failed.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(_) => {
                        warn!(task = %name, "worker task timed out after {per_task_timeout:?}");
                        failed.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        }));
    }

    // Barrier: all workers must finish before the round advances.
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("worker panicked: {e}");
        }
    }

    let completed = completed.load(Ordering::SeqCst);
    let failed = failed.load(Ordering::SeqCst);
    PoolStats {
        completed,
        failed,
        skipped: total - completed - failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn describe(task: &i32) -> String {
        task.to_string()
    }

    #[tokio::test]
    async fn all_tasks_complete_through_a_small_pool() {
        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let stats = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            run_worker_pool(
                (0..16).collect(),
                3,
                Duration::from_secs(5),
                &cancel,
                describe,
                move |_task| {
                    let running = Arc::clone(&running);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
            )
            .await
        };

        assert_eq!(stats.completed, 16);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.skipped, 0);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn one_failing_task_never_fails_the_round() {
        let cancel = CancellationToken::new();
        let stats = run_worker_pool(
            vec![1, 2, 3],
            2,
            Duration::from_secs(5),
            &cancel,
            describe,
            |task| async move {
                if task == 2 {
                    Err("http 503".to_string())
                } else {
                    Ok(())
                }
            },
        )
        .await;

        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tasks_are_bounded_by_the_per_task_timeout() {
        let cancel = CancellationToken::new();
        let stats = run_worker_pool(
            vec![1],
            1,
            Duration::from_millis(50),
            &cancel,
            describe,
            |_task| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            },
        )
        .await;

        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn cancellation_stops_new_work() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = run_worker_pool(
            (0..8).collect(),
            2,
            Duration::from_secs(5),
            &cancel,
            describe,
            |_task| async move { Ok(()) },
        )
        .await;

        assert_eq!(stats.completed, 0);
        assert_eq!(stats.skipped, 8);
    }
}
