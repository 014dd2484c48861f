/*
[INPUT]:  Per-call outcomes (success + latency, failure) for one balance source
[OUTPUT]: Four-state health status and rolling metrics snapshots
[POS]:    Router layer - source health model
[UPDATE]: When changing thresholds or health transitions
*/

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Push,
    Pull,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Push => "push",
            SourceKind::Pull => "pull",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failed,
    Recovering,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceHealth {
    pub source: SourceKind,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    /// Exponentially weighted, in milliseconds.
    pub avg_latency_ms: f64,
}

#[derive(Debug)]
struct Counters {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    requests: u64,
    successes: u64,
    failures: u64,
    avg_latency_ms: f64,
}

const LATENCY_WEIGHT: f64 = 0.2;

/// Health of one source.
///
/// `Failed` after `failure_threshold` consecutive failures. A failed source
/// moves to `Recovering` on its first success and back to `Healthy` after
/// `recovery_successes` consecutive successes; any failure while recovering
/// sends it straight back to `Failed`.
#[derive(Debug)]
pub struct HealthTracker {
    source: SourceKind,
    failure_threshold: u32,
    recovery_successes: u32,
    counters: Mutex<Counters>,
}

impl HealthTracker {
    pub fn new(source: SourceKind, failure_threshold: u32, recovery_successes: u32) -> Self {
        Self {
            source,
            failure_threshold: failure_threshold.max(1),
            recovery_successes: recovery_successes.max(1),
            counters: Mutex::new(Counters {
                status: HealthStatus::Healthy,
                consecutive_failures: 0,
                consecutive_successes: 0,
                requests: 0,
                successes: 0,
                failures: 0,
                avg_latency_ms: 0.0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_success(&self, latency: Duration) {
        let mut counters = self.lock();
        counters.requests += 1;
        counters.successes += 1;
        counters.consecutive_failures = 0;
        counters.consecutive_successes = counters.consecutive_successes.saturating_add(1);

        let latency_ms = latency.as_secs_f64() * 1000.0;
        counters.avg_latency_ms = if counters.successes == 1 {
            latency_ms
        } else {
            counters.avg_latency_ms + LATENCY_WEIGHT * (latency_ms - counters.avg_latency_ms)
        };

        let next = match counters.status {
            HealthStatus::Failed => {
                counters.consecutive_successes = 1;
                if self.recovery_successes <= 1 {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Recovering
                }
            }
            HealthStatus::Recovering if counters.consecutive_successes >= self.recovery_successes => {
                HealthStatus::Healthy
            }
            HealthStatus::Recovering => HealthStatus::Recovering,
            HealthStatus::Degraded | HealthStatus::Healthy => HealthStatus::Healthy,
        };
        self.transition(&mut counters, next);
    }

    pub fn record_failure(&self) {
        let mut counters = self.lock();
        counters.requests += 1;
        counters.failures += 1;
        counters.consecutive_successes = 0;
        counters.consecutive_failures = counters.consecutive_failures.saturating_add(1);

        let next = if counters.consecutive_failures >= self.failure_threshold
            || counters.status == HealthStatus::Recovering
        {
            HealthStatus::Failed
        } else {
            HealthStatus::Degraded
        };
        self.transition(&mut counters, next);
    }

    fn transition(&self, counters: &mut Counters, next: HealthStatus) {
        if counters.status == next {
            return;
        }
        match next {
            HealthStatus::Failed => warn!(
                source = self.source.as_str(),
                consecutive_failures = counters.consecutive_failures,
                "source failed"
            ),
            HealthStatus::Healthy if counters.status != HealthStatus::Degraded => {
                info!(source = self.source.as_str(), "source healthy again")
            }
            _ => {}
        }
        counters.status = next;
    }

    pub fn status(&self) -> HealthStatus {
        self.lock().status
    }

    pub fn snapshot(&self) -> SourceHealth {
        let counters = self.lock();
        SourceHealth {
            source: self.source,
            status: counters.status,
            consecutive_failures: counters.consecutive_failures,
            consecutive_successes: counters.consecutive_successes,
            requests: counters.requests,
            successes: counters.successes,
            failures: counters.failures,
            avg_latency_ms: counters.avg_latency_ms,
        }
    }
}
