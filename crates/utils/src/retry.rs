//! Bounded-attempt, bounded-duration retry primitive.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// The terminal error of an exhausted retry loop, carrying the attempt
/// count and the elapsed wall-clock time alongside the last error.
#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: usize,
    pub elapsed: Duration,
    pub last: E,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed after {} attempts (during {:?}), last error: {}",
            self.attempts, self.elapsed, self.last
        )
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Calls `f` until it succeeds, at most `attempts` times and not past
/// `timeout` of wall-clock time. On each failure the error is logged and
/// the loop sleeps for `sleep`. A zero `timeout` disables the wall-clock
/// limit; a zero `sleep` disables the delay.
pub async fn retry_during<F, Fut, T, E>(
    attempts: usize,
    timeout: Duration,
    sleep: Duration,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let start = Instant::now();

    let mut i = 0;
    loop {
        match f().await {
            Ok(value) => {
                if i > 0 {
                    debug!("[retry-{}/{}] success", i + 1, attempts);
                }
                return Ok(value);
            }
            Err(err) => {
                debug!("[retry-{}/{}] warning: {}", i + 1, attempts, err);
                i += 1;
                if i >= attempts {
                    return Err(RetryError {
                        attempts: i,
                        elapsed: start.elapsed(),
                        last: err,
                    });
                }
                if !timeout.is_zero() && start.elapsed() > timeout {
                    return Err(RetryError {
                        attempts: i,
                        elapsed: start.elapsed(),
                        last: err,
                    });
                }
                if !sleep.is_zero() {
                    tokio::time::sleep(sleep).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    #[tokio::test]
    async fn persistent_failure_invokes_exactly_n_times() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> =
            retry_during(5, Duration::ZERO, Duration::ZERO, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("boom")
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(err.attempts, 5);
        assert_eq!(err.last, "boom");
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let calls = AtomicUsize::new(0);
        let result = retry_during(5, Duration::ZERO, Duration::ZERO, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 3 {
                Ok(n)
            } else {
                Err("not yet")
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn single_attempt_never_sleeps() {
        let result: Result<(), _> =
            retry_during(1, Duration::ZERO, Duration::from_secs(3600), || async {
                Err::<(), _>("boom")
            })
            .await;
        assert_eq!(result.unwrap_err().attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wall_clock_bound_cuts_retries_short() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = retry_during(
            100,
            Duration::from_millis(250),
            Duration::from_millis(100),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("boom")
            },
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.attempts < 100);
        assert!(err.elapsed >= Duration::from_millis(250));
    }
}
