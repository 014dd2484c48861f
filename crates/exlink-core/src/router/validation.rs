use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::warn;

use exlink_adapter::BalanceEntry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    /// `total` differs from `available + reserved` by more than epsilon.
    Unbalanced { total: Decimal, parts: Decimal },
    Negative { field: &'static str, value: Decimal },
    FutureTimestamp { updated_at: DateTime<Utc> },
    TooOld { age_secs: i64 },
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationIssue::Unbalanced { total, parts } => {
                write!(f, "total {total} != available + reserved {parts}")
            }
            ValidationIssue::Negative { field, value } => write!(f, "{field} is negative: {value}"),
            ValidationIssue::FutureTimestamp { updated_at } => {
                write!(f, "timestamp in the future: {updated_at}")
            }
            ValidationIssue::TooOld { age_secs } => write!(f, "entry is {age_secs}s old"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ValidationCounters {
    pub checked: u64,
    pub failed: u64,
    pub cross_source_inconsistencies: u64,
}

/// Checks served entries and counts problems. Never rejects a value.
#[derive(Debug)]
pub struct BalanceValidator {
    epsilon: Decimal,
    cross_source_epsilon: Decimal,
    max_age: ChronoDuration,
    checked: AtomicU64,
    failed: AtomicU64,
    inconsistencies: AtomicU64,
}

/// Clock skew tolerated before a timestamp counts as "future".
const FUTURE_TOLERANCE_SECS: i64 = 5;

impl BalanceValidator {
    pub fn new(epsilon: Decimal, cross_source_epsilon: Decimal, max_age_secs: u64) -> Self {
        Self {
            epsilon,
            cross_source_epsilon,
            max_age: ChronoDuration::seconds(max_age_secs.min(i64::MAX as u64) as i64),
            checked: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            inconsistencies: AtomicU64::new(0),
        }
    }

    pub fn issues(&self, entry: &BalanceEntry, now: DateTime<Utc>) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        for (field, value) in [
            ("total", entry.total),
            ("reserved", entry.reserved),
            ("available", entry.available),
        ] {
            if value < Decimal::ZERO {
                issues.push(ValidationIssue::Negative { field, value });
            }
        }

        let parts = entry.available + entry.reserved;
        if (entry.total - parts).abs() > self.epsilon {
            issues.push(ValidationIssue::Unbalanced {
                total: entry.total,
                parts,
            });
        }

        if entry.updated_at > now + ChronoDuration::seconds(FUTURE_TOLERANCE_SECS) {
            issues.push(ValidationIssue::FutureTimestamp {
                updated_at: entry.updated_at,
            });
        } else if now - entry.updated_at > self.max_age {
            issues.push(ValidationIssue::TooOld {
                age_secs: (now - entry.updated_at).num_seconds(),
            });
        }

        issues
    }

    /// Count and log problems with a served entry. Returns true when clean.
    pub fn check(&self, entry: &BalanceEntry, now: DateTime<Utc>) -> bool {
        self.checked.fetch_add(1, Ordering::Relaxed);
        let issues = self.issues(entry, now);
        if issues.is_empty() {
            return true;
        }

        self.failed.fetch_add(1, Ordering::Relaxed);
        for issue in &issues {
            warn!(asset = %entry.asset, source = %entry.source, issue = %issue, "balance validation failed");
        }
        false
    }

    /// Compare push and pull totals for one asset. Returns true when they agree.
    pub fn check_cross_source(&self, push: &BalanceEntry, pull: &BalanceEntry) -> bool {
        let diff = (push.total - pull.total).abs();
        if diff <= self.cross_source_epsilon {
            return true;
        }
        self.inconsistencies.fetch_add(1, Ordering::Relaxed);
        warn!(
            asset = %push.asset,
            push_total = %push.total,
            pull_total = %pull.total,
            diff = %diff,
            "push and pull balances disagree"
        );
        false
    }

    pub fn counters(&self) -> ValidationCounters {
        ValidationCounters {
            checked: self.checked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cross_source_inconsistencies: self.inconsistencies.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exlink_adapter::SourceTag;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    fn validator() -> BalanceValidator {
        BalanceValidator::new(dec("0.001"), dec("0.01"), 3600)
    }

    fn entry(total: &str, reserved: &str, updated_at: DateTime<Utc>) -> BalanceEntry {
        BalanceEntry::new("USDT", dec(total), dec(reserved), updated_at, SourceTag::Pull).unwrap()
    }

    #[test]
    fn clean_entry_passes() {
        let now = Utc::now();
        let validator = validator();
        assert!(validator.check(&entry("10", "2", now), now));
        assert_eq!(validator.counters().failed, 0);
        assert_eq!(validator.counters().checked, 1);
    }

    #[test]
    fn hand_built_inconsistent_entry_is_flagged() {
        let now = Utc::now();
        let mut bad = entry("10", "2", now);
        bad.available = dec("9");
        bad.reserved = dec("-1");

        let issues = validator().issues(&bad, now);
        assert!(issues.contains(&ValidationIssue::Negative {
            field: "reserved",
            value: dec("-1"),
        }));
        assert!(issues
            .iter()
            .any(|issue| matches!(issue, ValidationIssue::Unbalanced { .. })));
    }

    #[test]
    fn timestamps_are_bounded() {
        let now = Utc::now();
        let validator = validator();

        let future = entry("1", "0", now + ChronoDuration::minutes(5));
        assert!(matches!(
            validator.issues(&future, now).as_slice(),
            [ValidationIssue::FutureTimestamp { .. }]
        ));

        let old = entry("1", "0", now - ChronoDuration::hours(2));
        assert!(!validator.check(&old, now));
        assert_eq!(validator.counters().failed, 1);
    }

    #[test]
    fn cross_source_epsilon() {
        let now = Utc::now();
        let validator = validator();
        let push = entry("100", "0", now);

        assert!(validator.check_cross_source(&push, &entry("100.005", "0", now)));
        assert!(!validator.check_cross_source(&push, &entry("100.02", "0", now)));
        assert_eq!(validator.counters().cross_source_inconsistencies, 1);
    }
}
