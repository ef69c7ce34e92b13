//! Retry with exponential backoff.
//!
//! A [`RetryPolicy`] wraps a fallible async operation and re-runs it while
//! the failure is eligible and attempts remain. Eligibility is either "any
//! non-configuration error", "contention only" (per the classifier), or a
//! caller-supplied predicate. Construction parameters are checked up front
//! so a bad policy fails where it is built, not where it is used.

use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Hard ceiling on a single backoff sleep, whatever the schedule computes.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
    backoff: f64,
    contention_only: bool,
    retry_if: Option<RetryPredicate>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .field("backoff", &self.backoff)
            .field("contention_only", &self.contention_only)
            .field("has_predicate", &self.retry_if.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// Build a policy. `max_attempts` must be at least 1, `delay` positive
    /// and `backoff` at least 1.0; anything else fails here, at wrap time.
    pub fn new(max_attempts: u32, delay: Duration, backoff: f64) -> Result<Self> {
        if max_attempts < 1 {
            return Err(Error::configuration(
                "max_attempts",
                "must be at least 1",
            ));
        }
        if delay.is_zero() {
            return Err(Error::configuration("delay", "must be greater than zero"));
        }
        if !(backoff >= 1.0) {
            return Err(Error::configuration("backoff", "must be at least 1.0"));
        }
        Ok(Self {
            max_attempts,
            delay,
            backoff,
            contention_only: false,
            retry_if: None,
        })
    }

    /// Restrict retries to contention errors (deadlock, lock timeout,
    /// serialization failure).
    pub fn contention_only(mut self) -> Self {
        self.contention_only = true;
        self
    }

    /// Restrict retries to errors matching `pred`.
    pub fn with_retry_if(
        mut self,
        pred: impl Fn(&Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_if = Some(Arc::new(pred));
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Is this failure eligible for another attempt?
    pub fn should_retry(&self, err: &Error) -> bool {
        if err.is_configuration() {
            return false;
        }
        if self.contention_only {
            return err.is_contention();
        }
        match &self.retry_if {
            Some(pred) => pred(err),
            None => true,
        }
    }

    /// Sleep duration before the attempt after `attempt` (1-based):
    /// `delay * backoff^(attempt-1)`, capped at [`MAX_BACKOFF`].
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff.powi(exponent);
        let secs = (self.delay.as_secs_f64() * factor).min(MAX_BACKOFF.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Run `op` until it succeeds, exhausts `max_attempts`, or fails with an
    /// ineligible error. The original error is returned unchanged; success
    /// returns immediately with no extra attempts.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.max_attempts || !self.should_retry(&err) {
                        return Err(err);
                    }
                    let delay = self.backoff_delay(attempt);
                    debug!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after eligible failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{DialectFamily, DriverFault};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_invalid_params_fail_at_construction() {
        assert!(RetryPolicy::new(0, Duration::from_millis(1), 2.0).is_err());
        assert!(RetryPolicy::new(3, Duration::ZERO, 2.0).is_err());
        assert!(RetryPolicy::new(3, Duration::from_millis(1), 0.5).is_err());
        assert!(RetryPolicy::new(3, Duration::from_millis(1), f64::NAN).is_err());
        assert!(RetryPolicy::new(1, Duration::from_millis(1), 1.0).is_ok());
    }

    #[test]
    fn test_backoff_delay_schedule() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), 2.0).unwrap();
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_delay_saturates_at_cap() {
        // Large exponents push the factor past Duration range; the delay
        // must cap instead of panicking.
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(1), 10.0).unwrap();
        assert_eq!(policy.backoff_delay(500), MAX_BACKOFF);
        assert_eq!(policy.backoff_delay(u32::MAX), MAX_BACKOFF);
        // Schedules below the cap are unaffected.
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_success_returns_immediately() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), 2.0).unwrap();
        let calls = AtomicU32::new(0);
        let result = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Error>(42) }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), 1.0)
            .unwrap()
            .contention_only();
        let calls = AtomicU32::new(0);
        let result = policy
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(Error::query(
                            "execute",
                            DriverFault::new(
                                DialectFamily::MySql,
                                Some("1213".into()),
                                "deadlock",
                            ),
                        ))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_preserves_original_error() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), 1.0)
            .unwrap()
            .contention_only();
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::query(
                        "execute",
                        DriverFault::new(
                            DialectFamily::Postgres,
                            Some("40001".into()),
                            "serialization failure",
                        ),
                    ))
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Query { .. }));
        assert_eq!(err.fault().and_then(|f| f.code.as_deref()), Some("40001"));
    }

    #[tokio::test]
    async fn test_contention_only_skips_plain_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), 1.0)
            .unwrap()
            .contention_only();
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::engine("start", "boom")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_configuration_errors_never_retried() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), 1.0).unwrap();
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::configuration("timeout", "bad")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_predicate_restricts_eligibility() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), 1.0)
            .unwrap()
            .with_retry_if(|e| matches!(e, Error::Session { .. }));
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::engine("start", "boom")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
