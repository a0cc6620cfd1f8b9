//! Shared fan-out driver.
//!
//! Every coordinator spawns one task per segment number and collects the
//! arrivals against a completion policy under a deadline. Outstanding
//! tasks are aborted once the outcome is decided; a request already on
//! the wire may still be processed by its destination, which is safe
//! because every operation is idempotent under timestamp ordering.

use std::future::Future;
use std::time::Duration;

use strand_types::SegmentNumber;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::CoordinatorError;

/// When a fan-out is considered complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Every task must succeed; the first failure decides the outcome.
    All,
    /// The first `k` successes decide the outcome; remaining tasks are
    /// aborted.
    Agreement(usize),
    /// Every task runs to completion (or the deadline); at least `k`
    /// must have succeeded. Used when the result merges all replies:
    /// listing and stat count votes across destinations, so aborting at
    /// `k` would make the merged answer depend on arrival order.
    Gather(usize),
}

/// One per-segment arrival.
#[derive(Debug)]
pub struct Arrival<T> {
    pub segment: SegmentNumber,
    pub value: T,
}

/// Run the tagged per-segment futures and collect arrivals per `policy`.
///
/// Successes come back in arrival order. Fails fast the moment the policy
/// is provably unreachable; a deadline overrun is
/// [`CoordinatorError::Timeout`].
pub async fn drive<T, Fut>(
    policy: CompletionPolicy,
    timeout: Duration,
    tasks: Vec<(SegmentNumber, Fut)>,
) -> Result<Vec<Arrival<T>>, CoordinatorError>
where
    T: Send + 'static,
    Fut: Future<Output = Result<T, CoordinatorError>> + Send + 'static,
{
    let total = tasks.len();
    let needed = match policy {
        CompletionPolicy::All => total,
        CompletionPolicy::Agreement(k) | CompletionPolicy::Gather(k) => k,
    };
    let early_return = matches!(policy, CompletionPolicy::Agreement(_));
    let deadline = tokio::time::Instant::now() + timeout;

    let mut set = JoinSet::new();
    for (segment, fut) in tasks {
        set.spawn(async move { (segment, fut.await) });
    }

    let mut arrivals: Vec<Arrival<T>> = Vec::new();
    let mut failed = 0usize;
    let mut first_rejection: Option<CoordinatorError> = None;

    loop {
        let joined = match tokio::time::timeout_at(deadline, set.join_next()).await {
            Ok(Some(joined)) => joined,
            Ok(None) => break,
            Err(_) => {
                set.abort_all();
                if arrivals.len() >= needed {
                    // The policy was met; only stragglers ran out of time.
                    return Ok(arrivals);
                }
                return Err(CoordinatorError::Timeout);
            }
        };

        match joined {
            Ok((segment, Ok(value))) => {
                debug!(segment, "segment task completed");
                arrivals.push(Arrival { segment, value });
                if early_return && arrivals.len() >= needed {
                    set.abort_all();
                    return Ok(arrivals);
                }
            }
            Ok((segment, Err(e))) => {
                warn!(segment, error = %e, "segment task failed");
                failed += 1;
                if first_rejection.is_none() {
                    first_rejection = Some(e);
                }
            }
            Err(join_err) => {
                warn!(error = %join_err, "segment task panicked or was cancelled");
                failed += 1;
            }
        }

        // Fail fast once the policy can no longer be met.
        if failed > total - needed {
            set.abort_all();
            return Err(match first_rejection {
                Some(rejection) if matches!(policy, CompletionPolicy::All) => rejection,
                _ => CoordinatorError::QuorumUnreachable {
                    needed,
                    failed,
                    total,
                },
            });
        }
    }

    if arrivals.len() >= needed {
        Ok(arrivals)
    } else {
        Err(CoordinatorError::QuorumUnreachable {
            needed,
            failed,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::pin::Pin;

    type Task = Pin<Box<dyn Future<Output = Result<u32, CoordinatorError>> + Send>>;

    fn ok_after(ms: u64, value: u32) -> Task {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(value)
        })
    }

    fn fail_after(ms: u64) -> Task {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Err(CoordinatorError::Timeout)
        })
    }

    #[tokio::test]
    async fn test_all_policy_collects_everything() {
        let tasks = vec![
            (1, ok_after(5, 10)),
            (2, ok_after(1, 20)),
            (3, ok_after(3, 30)),
        ];
        let arrivals = drive(CompletionPolicy::All, Duration::from_secs(1), tasks)
            .await
            .unwrap();
        assert_eq!(arrivals.len(), 3);
        // Arrival order, not segment order.
        assert_eq!(arrivals[0].segment, 2);
    }

    #[tokio::test]
    async fn test_all_policy_fails_on_first_failure() {
        let tasks = vec![(1, ok_after(50, 10)), (2, fail_after(1))];
        let err = drive(CompletionPolicy::All, Duration::from_secs(1), tasks)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Timeout));
    }

    #[tokio::test]
    async fn test_agreement_returns_after_k() {
        let tasks = vec![
            (1, ok_after(1, 10)),
            (2, ok_after(2, 20)),
            // This one would outlive the deadline; agreement must not wait.
            (3, ok_after(10_000, 30)),
        ];
        let arrivals = drive(
            CompletionPolicy::Agreement(2),
            Duration::from_millis(500),
            tasks,
        )
        .await
        .unwrap();
        assert_eq!(arrivals.len(), 2);
    }

    #[tokio::test]
    async fn test_agreement_fails_fast_when_unreachable() {
        let started = std::time::Instant::now();
        let tasks = vec![
            (1, fail_after(1)),
            (2, fail_after(1)),
            (3, ok_after(10_000, 30)),
        ];
        let err = drive(
            CompletionPolicy::Agreement(2),
            Duration::from_secs(30),
            tasks,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::QuorumUnreachable { needed: 2, .. }
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_gather_waits_for_all() {
        let tasks = vec![
            (1, ok_after(1, 10)),
            (2, ok_after(1, 20)),
            (3, ok_after(30, 30)),
        ];
        let arrivals = drive(CompletionPolicy::Gather(2), Duration::from_secs(1), tasks)
            .await
            .unwrap();
        // Gather keeps going past k to collect the straggler.
        assert_eq!(arrivals.len(), 3);
    }

    #[tokio::test]
    async fn test_gather_tolerates_failures_above_k() {
        let tasks = vec![
            (1, ok_after(1, 10)),
            (2, fail_after(1)),
            (3, ok_after(1, 30)),
        ];
        let arrivals = drive(CompletionPolicy::Gather(2), Duration::from_secs(1), tasks)
            .await
            .unwrap();
        assert_eq!(arrivals.len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_without_quorum() {
        let tasks = vec![(1, ok_after(10_000, 10)), (2, ok_after(10_000, 20))];
        let err = drive(CompletionPolicy::All, Duration::from_millis(50), tasks)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Timeout));
    }
}
