//! Bounded retrying of flaky registry operations.
//!
//! All registry writes are content-addressed, so repeating a failed
//! operation is safe. The runner sleeps between attempts on a plain timer
//! future, which means dropping the enclosing task cancels an in-flight
//! pause immediately.

use std::future::Future;
use std::time::Duration;

use log::warn;

use crate::errors::MirrorError;

/// A retry schedule: attempt budget and fixed inter-attempt pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Total number of attempts (including the first one).
    pub attempts: usize,
    /// Pause between consecutive attempts.
    pub pause: Duration,
}

/// Schedule for read-side network operations.
pub const ON_PULL: Schedule = Schedule {
    attempts: 4,
    pause: Duration::from_secs(3),
};

/// Schedule for write-side operations, where registries under load
/// misbehave for longer.
pub const ON_PUSH: Schedule = Schedule {
    attempts: 19,
    pause: Duration::from_secs(3),
};

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// schedule is exhausted. The last observed error is returned.
pub async fn with_retries<T, F, Fut>(
    what: &str,
    schedule: Schedule,
    mut op: F,
) -> Result<T, MirrorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MirrorError>>,
{
    debug_assert!(schedule.attempts > 0);
    let mut last_err = None;

    for attempt in 1..=schedule.attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                if attempt < schedule.attempts {
                    warn!(
                        "[{}] attempt {}/{} failed: {}; retrying in {:?}",
                        what, attempt, schedule.attempts, err, schedule.pause
                    );
                    tokio::time::sleep(schedule.pause).await;
                }
                last_err = Some(err);
            }
        }
    }

    Err(last_err.expect("at least one attempt was made"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick(attempts: usize) -> Schedule {
        Schedule {
            attempts,
            pause: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicUsize::new(0);
        let out = with_retries("op", quick(4), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, MirrorError>(42) }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_exhaustion() {
        let calls = AtomicUsize::new(0);
        let err = with_retries("op", quick(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(MirrorError::NetworkUnavailable("refused".into())) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.as_kind(), "network");
    }

    #[tokio::test]
    async fn recovers_midway() {
        let calls = AtomicUsize::new(0);
        let out = with_retries("op", quick(4), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(MirrorError::NetworkUnavailable("reset".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn aborts_on_non_retryable() {
        let calls = AtomicUsize::new(0);
        let err = with_retries("op", quick(19), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(MirrorError::Unauthorized("denied".into())) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.as_kind(), "auth");
    }
}
