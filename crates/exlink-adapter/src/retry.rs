/*
[INPUT]:  Failure/success outcomes of exchange calls
[OUTPUT]: Backoff delays, retried futures, and circuit-breaker admission decisions
[POS]:    Resilience layer - shared by token refresh, balance routing, order submission
[UPDATE]: When changing backoff shape or breaker state transitions
*/

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::http::{ExchangeError, Result};

/// Exponential backoff parameters: `base * 2^(attempt-1)`, clamped at `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 30_000,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base_ms: base.as_millis() as u64,
            cap_ms: cap.as_millis() as u64,
            max_attempts,
        }
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let millis = self.base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(millis.min(self.cap_ms))
    }

    /// Run `op` up to `max_attempts` times, sleeping between attempts while
    /// `should_retry` accepts the error. The last error is returned.
    pub async fn retry<T, F, Fut>(
        &self,
        label: &str,
        mut op: F,
        should_retry: impl Fn(&ExchangeError) -> bool,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts && should_retry(&err) => {
                    let delay = self.delay(attempt);
                    warn!(label, attempt, max_attempts = attempts, ?delay, error = %err, "retrying after failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Read-only breaker snapshot for supervisors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStatus {
    pub name: &'static str,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub remaining_secs: u64,
    pub trips: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    trips: u64,
}

/// Failure-count circuit breaker with a fixed cooldown and a half-open probe.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name,
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                open_until: None,
                trips: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a call may proceed. An expired open breaker moves to half-open.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = inner
                    .open_until
                    .map(|until| Instant::now() >= until)
                    .unwrap_or(true);
                if expired {
                    debug!(breaker = self.name, "cooldown elapsed, half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.open_until = None;
                }
                expired
            }
        }
    }

    /// Like [`allow`](Self::allow), but returns `CircuitOpen` when rejected.
    pub fn check(&self) -> Result<()> {
        if self.allow() {
            Ok(())
        } else {
            Err(ExchangeError::CircuitOpen {
                component: self.name,
                remaining_secs: self.remaining().as_secs(),
            })
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            debug!(breaker = self.name, "closing after success");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.open_until = None;
    }

    /// Count a failure. Returns true when this failure opened the breaker.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let should_trip = inner.state == CircuitState::HalfOpen
            || (inner.state == CircuitState::Closed
                && inner.consecutive_failures >= self.failure_threshold);
        if should_trip {
            self.open_locked(&mut inner);
        }
        should_trip
    }

    /// Open immediately regardless of the failure count.
    pub fn trip(&self) {
        let mut inner = self.lock();
        self.open_locked(&mut inner);
    }

    fn open_locked(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.open_until = Some(Instant::now() + self.cooldown);
        inner.trips += 1;
        warn!(
            breaker = self.name,
            consecutive_failures = inner.consecutive_failures,
            cooldown_secs = self.cooldown.as_secs(),
            "circuit breaker opened"
        );
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        let inner = self.lock();
        inner.state == CircuitState::Open
            && inner
                .open_until
                .map(|until| Instant::now() < until)
                .unwrap_or(false)
    }

    /// Time left in the current cooldown, zero when not open.
    pub fn remaining(&self) -> Duration {
        let inner = self.lock();
        match (inner.state, inner.open_until) {
            (CircuitState::Open, Some(until)) => until.saturating_duration_since(Instant::now()),
            _ => Duration::ZERO,
        }
    }

    pub fn status(&self) -> BreakerStatus {
        let remaining_secs = self.remaining().as_secs();
        let inner = self.lock();
        BreakerStatus {
            name: self.name,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            remaining_secs,
            trips: inner.trips,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_clamps_at_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(6), Duration::from_secs(30));
        assert_eq!(policy.delay(40), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_after_max_attempts() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = policy
            .retry(
                "test",
                |_| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(ExchangeError::Timeout { duration_ms: 10 })
                    }
                },
                ExchangeError::is_retryable,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_does_not_repeat_terminal_errors() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = policy
            .retry(
                "test",
                |_| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(ExchangeError::PermissionDenied {
                            message: "EGeneral:Permission denied".to_string(),
                        })
                    }
                },
                ExchangeError::is_retryable,
            )
            .await;

        assert!(matches!(result, Err(ExchangeError::PermissionDenied { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_at_threshold_and_half_opens_after_cooldown() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(60));

        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure());
        assert!(!breaker.allow());
        assert!(breaker.is_open());
        assert!(matches!(
            breaker.check(),
            Err(ExchangeError::CircuitOpen { component: "test", .. })
        ));

        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // a failed probe re-opens immediately
        assert!(breaker.record_failure());
        assert!(!breaker.allow());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.status().trips, 2);
    }
}
