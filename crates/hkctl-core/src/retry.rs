//! Bounded retry with a fixed delay and cooperative cancellation.
//!
//! Every "poll until it works" loop in provisioning goes through
//! [`retry_bounded`]: waiting for a server to accept SSH, for a load balancer
//! to get a public address, for a target attachment to be accepted, and for
//! bootstrap commands to succeed on the first master.
//!
//! # Example
//!
//! ```ignore
//! use hkctl_core::retry::{retry_bounded, RetryPolicy};
//!
//! let ip = retry_bounded(&policy, &cancel, "wait for master-1", |attempt| async move {
//!     poller.probe_server("master-1", "root").await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Attempt budget and delay for bounded retries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; at most `limit + 1` attempts are made
    pub limit: u32,
    /// Fixed delay between attempts
    pub wait: Duration,
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(limit: u32, wait: Duration) -> Self {
        Self { limit, wait }
    }
}

/// Sleep for `wait`, returning early with [`Error::Cancelled`] if the token fires.
pub async fn sleep_or_cancel(
    cancel: &CancellationToken,
    wait: Duration,
    operation: &str,
) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled(operation)),
        _ = tokio::time::sleep(wait) => Ok(()),
    }
}

/// Run `probe` until it succeeds, the budget is exhausted, or the run is cancelled.
///
/// The probe receives the 1-based attempt number. Cancellation is checked
/// before every attempt and during every delay, and always wins over the
/// attempt counter. Terminal errors returned by the probe (cancellation or an
/// inner retry-limit) are propagated without further attempts.
pub async fn retry_bounded<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut probe: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(operation));
        }

        if attempt > policy.limit {
            warn!(operation = %operation, attempts = attempt, "Retry limit reached");
            return Err(Error::retry_limit(operation, attempt));
        }

        if attempt > 0 {
            sleep_or_cancel(cancel, policy.wait, operation).await?;
        }

        attempt += 1;
        debug!(operation = %operation, attempt = attempt, "Attempting");

        match probe(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_terminal() => return Err(e),
            Err(e) => {
                warn!(
                    operation = %operation,
                    attempt = attempt,
                    error = %e,
                    stderr = %e.remote_stderr().trim(),
                    "Attempt failed, retrying"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn immediate(limit: u32) -> RetryPolicy {
        RetryPolicy::new(limit, Duration::ZERO)
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let cancel = CancellationToken::new();
        let result = retry_bounded(&immediate(3), &cancel, "op", |_| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let cancel = CancellationToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = retry_bounded(&immediate(3), &cancel, "op", |_| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::provider("not yet"))
                } else {
                    Ok("ready")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ready");
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn makes_at_most_limit_plus_one_attempts() {
        let cancel = CancellationToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<()> = retry_bounded(&immediate(4), &cancel, "op", |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::provider("never"))
            }
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_retry_limit());
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn zero_limit_means_single_attempt() {
        let cancel = CancellationToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<()> = retry_bounded(&immediate(0), &cancel, "op", |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::provider("never"))
            }
        })
        .await;

        assert!(result.unwrap_err().is_retry_limit());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_wins_over_remaining_budget() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let result: Result<()> = retry_bounded(&immediate(100), &cancel, "op", |attempt| {
            let token = token.clone();
            async move {
                if attempt == 2 {
                    token.cancel();
                }
                Err(Error::provider("still failing"))
            }
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_cancelled());
        assert!(!err.is_retry_limit());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_delay() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(5, Duration::from_secs(3600));
        let token = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let result: Result<()> = retry_bounded(&policy, &cancel, "op", |_| async {
            Err(Error::provider("down"))
        })
        .await;

        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn terminal_probe_errors_are_not_retried() {
        let cancel = CancellationToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<()> = retry_bounded(&immediate(10), &cancel, "outer", |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::retry_limit("inner", 3))
            }
        })
        .await;

        assert!(result.unwrap_err().is_retry_limit());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn already_cancelled_never_probes() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<()> = retry_bounded(&immediate(3), &cancel, "op", |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
