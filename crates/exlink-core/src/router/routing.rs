/*
[INPUT]:  RealtimeBalanceChannel (push), BalanceSource (pull), TokenLifecycleManager (reconnects)
[OUTPUT]: Balance reads with source selection, validation, cache fallback and health reporting
[POS]:    Router layer - single balance API for the strategy layer
[UPDATE]: When changing selection policy, merge rules, or the health loop
*/

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use exlink_adapter::{
    BalanceEntry, BalanceSource, BreakerStatus, CircuitBreaker, ExchangeError, RetryPolicy,
    SourceTag, TokenLifecycleManager,
};

use super::health::{HealthStatus, HealthTracker, SourceHealth, SourceKind};
use super::validation::{BalanceValidator, ValidationCounters};
use crate::balance::{ChannelState, QuoteAliases, RealtimeBalanceChannel};
use crate::error::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Probability of serving a healthy, fresh push value.
    pub push_ratio: f64,
    /// Push entries older than this are not served directly.
    pub max_age_secs: u64,
    pub cache_ttl_secs: u64,
    pub failure_threshold: u32,
    pub recovery_successes: u32,
    pub pull_timeout_ms: u64,
    pub pull_breaker_cooldown_secs: u64,
    pub validation_epsilon: Decimal,
    pub cross_source_epsilon: Decimal,
    pub max_entry_age_secs: u64,
    pub health_interval_secs: u64,
    /// Backoff between push reconnect attempts.
    pub reconnect: RetryPolicy,
    /// Prefer a pull read whenever pull is available.
    pub force_fresh: bool,
    /// Fraction of available quote held back for fees.
    pub fee_buffer_ratio: Decimal,
    pub quote_aliases: QuoteAliases,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            push_ratio: 0.90,
            max_age_secs: 60,
            cache_ttl_secs: 30,
            failure_threshold: 3,
            recovery_successes: 2,
            pull_timeout_ms: 10_000,
            pull_breaker_cooldown_secs: 30,
            validation_epsilon: Decimal::new(1, 3),
            cross_source_epsilon: Decimal::new(1, 2),
            max_entry_age_secs: 3_600,
            health_interval_secs: 15,
            reconnect: RetryPolicy::default(),
            force_fresh: false,
            fee_buffer_ratio: Decimal::new(26, 4),
            quote_aliases: QuoteAliases::default(),
        }
    }
}

impl RouterConfig {
    fn max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_age_secs as i64)
    }

    fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache_ttl_secs as i64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServedCounters {
    pub push: u64,
    pub pull: u64,
    pub cache: u64,
    pub unavailable: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterHealth {
    pub push: SourceHealth,
    pub pull: SourceHealth,
    pub push_disabled: bool,
    pub channel: ChannelState,
    pub pull_breaker: BreakerStatus,
    pub validation: ValidationCounters,
    pub served: ServedCounters,
    pub cached_assets: usize,
}

#[derive(Debug, Default)]
struct RouterCache {
    /// Latest accepted value per asset from either source.
    merged: HashMap<String, BalanceEntry>,
    /// Latest pull value per asset, for cross-source checks.
    last_pull: HashMap<String, BalanceEntry>,
}

#[derive(Debug, Default)]
struct Served {
    push: AtomicU64,
    pull: AtomicU64,
    cache: AtomicU64,
    unavailable: AtomicU64,
}

/// Single balance API over the push channel, the pull source and a short
/// cache. Routine degradation never errors; only "no usable data" does.
pub struct ConnectivityRouter {
    config: RouterConfig,
    channel: Arc<RealtimeBalanceChannel>,
    pull: Arc<dyn BalanceSource>,
    push_health: HealthTracker,
    pull_health: HealthTracker,
    pull_breaker: CircuitBreaker,
    validator: BalanceValidator,
    cache: Mutex<RouterCache>,
    push_disabled: AtomicBool,
    reconnect_failures: AtomicU32,
    next_reconnect: StdMutex<Option<Instant>>,
    served: Served,
}

impl std::fmt::Debug for ConnectivityRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityRouter")
            .field("push", &self.push_health.status())
            .field("pull", &self.pull_health.status())
            .field("push_disabled", &self.push_disabled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ConnectivityRouter {
    pub fn new(
        config: RouterConfig,
        channel: Arc<RealtimeBalanceChannel>,
        pull: Arc<dyn BalanceSource>,
    ) -> Self {
        let push_health =
            HealthTracker::new(SourceKind::Push, config.failure_threshold, config.recovery_successes);
        let pull_health =
            HealthTracker::new(SourceKind::Pull, config.failure_threshold, config.recovery_successes);
        let pull_breaker = CircuitBreaker::new(
            "pull_balances",
            config.failure_threshold,
            Duration::from_secs(config.pull_breaker_cooldown_secs),
        );
        let validator = BalanceValidator::new(
            config.validation_epsilon,
            config.cross_source_epsilon,
            config.max_entry_age_secs,
        );

        Self {
            config,
            channel,
            pull,
            push_health,
            pull_health,
            pull_breaker,
            validator,
            cache: Mutex::new(RouterCache::default()),
            push_disabled: AtomicBool::new(false),
            reconnect_failures: AtomicU32::new(0),
            next_reconnect: StdMutex::new(None),
            served: Served::default(),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn channel(&self) -> &Arc<RealtimeBalanceChannel> {
        &self.channel
    }

    pub fn tracker(&self, source: SourceKind) -> &HealthTracker {
        match source {
            SourceKind::Push => &self.push_health,
            SourceKind::Pull => &self.pull_health,
        }
    }

    pub fn is_push_disabled(&self) -> bool {
        self.push_disabled.load(Ordering::Relaxed)
    }

    /// Stop using push for good (missing streaming entitlement).
    pub fn disable_push(&self, reason: &str) {
        if !self.push_disabled.swap(true, Ordering::SeqCst) {
            warn!(reason, "push balances disabled; serving pull only");
        }
    }

    pub async fn get_balance(&self, asset: &str) -> Result<BalanceEntry> {
        self.get_balance_with(asset, self.config.force_fresh).await
    }

    /// Like [`get_balance`](Self::get_balance); `force_fresh` prefers a pull read.
    pub async fn get_balance_with(&self, asset: &str, force_fresh: bool) -> Result<BalanceEntry> {
        let asset = asset.trim().to_ascii_uppercase();
        let now = Utc::now();
        let push_entry = self.push_candidate(&asset, now);

        if !force_fresh
            && let Some(entry) = &push_entry
            && self.draw_push()
        {
            return Ok(self.serve(entry.clone(), now).await);
        }

        if self.pull_eligible() {
            match self.fetch_pull().await {
                Ok(entries) => {
                    if let Some(entry) = entries.into_iter().find(|entry| entry.asset == asset) {
                        return Ok(self.serve(entry, now).await);
                    }
                    debug!(asset = %asset, "asset absent from pull result");
                }
                Err(err) => debug!(asset = %asset, error = %err, "pull read failed"),
            }
        }

        if let Some(entry) = push_entry {
            return Ok(self.serve(entry, now).await);
        }

        let cached = self.cache.lock().await.merged.get(&asset).cloned();
        if let Some(entry) = cached
            && now - entry.updated_at <= self.config.cache_ttl()
        {
            return Ok(self.serve(entry.with_source(SourceTag::Cache), now).await);
        }

        self.served.unavailable.fetch_add(1, Ordering::Relaxed);
        warn!(asset = %asset, "no usable balance from any source");
        Err(CoreError::Unavailable { asset })
    }

    pub async fn get_all_balances(&self) -> Result<Vec<BalanceEntry>> {
        self.get_all_balances_with(self.config.force_fresh).await
    }

    /// Every known asset. Push entries past `max_age` are replaced from pull
    /// when it is available; assets missing from the chosen source are filled
    /// from cache and tagged `Cache`.
    pub async fn get_all_balances_with(&self, force_fresh: bool) -> Result<Vec<BalanceEntry>> {
        let now = Utc::now();

        let mut fresh: Option<Vec<BalanceEntry>> = None;
        let mut stale: HashSet<String> = HashSet::new();
        if !force_fresh && self.push_usable() {
            let snapshot = self.channel.snapshot();
            if !snapshot.is_empty() && self.draw_push() {
                self.push_health.record_success(Duration::ZERO);
                let (current, aged) = split_by_age(&snapshot, now, self.config.max_age());
                if !current.is_empty() {
                    fresh = Some(current);
                    stale = aged;
                }
            }
        }
        if let Some(entries) = fresh.as_mut()
            && !stale.is_empty()
        {
            debug!(stale = stale.len(), "push entries past max age");
            if self.pull_eligible() {
                match self.fetch_pull().await {
                    Ok(pulled) => {
                        entries.extend(pulled.into_iter().filter(|entry| stale.remove(&entry.asset)))
                    }
                    Err(err) => debug!(error = %err, "pull read for stale assets failed"),
                }
            }
        }
        if fresh.is_none() && self.pull_eligible() {
            match self.fetch_pull().await {
                Ok(entries) => fresh = Some(entries),
                Err(err) => debug!(error = %err, "pull read failed"),
            }
        }
        if fresh.is_none() && self.push_usable() {
            let snapshot = self.channel.snapshot();
            let (current, aged) = split_by_age(&snapshot, now, self.config.max_age());
            if !current.is_empty() {
                fresh = Some(current);
                stale = aged;
            }
        }

        let mut served = Vec::new();
        match fresh {
            Some(entries) => {
                let mut seen = HashSet::new();
                for entry in entries {
                    seen.insert(entry.asset.clone());
                    served.push(self.serve(entry, now).await);
                }
                let cached: Vec<BalanceEntry> = {
                    let cache = self.cache.lock().await;
                    cache
                        .merged
                        .values()
                        .filter(|entry| !seen.contains(&entry.asset))
                        .filter(|entry| {
                            !stale.contains(&entry.asset)
                                || now - entry.updated_at <= self.config.cache_ttl()
                        })
                        .map(|entry| entry.with_source(SourceTag::Cache))
                        .collect()
                };
                for entry in cached {
                    served.push(self.serve(entry, now).await);
                }
            }
            None => {
                let cached: Vec<BalanceEntry> = {
                    let cache = self.cache.lock().await;
                    cache
                        .merged
                        .values()
                        .filter(|entry| now - entry.updated_at <= self.config.cache_ttl())
                        .map(|entry| entry.with_source(SourceTag::Cache))
                        .collect()
                };
                if cached.is_empty() {
                    self.served.unavailable.fetch_add(1, Ordering::Relaxed);
                    warn!("no usable balances from any source");
                    return Err(CoreError::Unavailable {
                        asset: "*".to_string(),
                    });
                }
                for entry in cached {
                    served.push(self.serve(entry, now).await);
                }
            }
        }

        served.sort_by(|a, b| a.asset.cmp(&b.asset));
        Ok(served)
    }

    /// Aliased quote currencies summed into one entry.
    pub async fn get_quote_total(&self) -> Result<BalanceEntry> {
        let aliases = &self.config.quote_aliases;
        let balances = self.get_all_balances().await?;
        aliases
            .aggregate(&balances)
            .ok_or_else(|| CoreError::Unavailable {
                asset: aliases.quote.clone(),
            })
    }

    /// Available quote minus the configured fee buffer.
    pub async fn get_spendable_quote(&self) -> Result<Decimal> {
        let quote = self.get_quote_total().await?;
        let buffer = quote.available * self.config.fee_buffer_ratio;
        Ok((quote.available - buffer).max(Decimal::ZERO))
    }

    /// Pull every balance now and merge it into the cache.
    pub async fn refresh_from_pull(&self) -> Result<usize> {
        let entries = self.fetch_pull().await?;
        Ok(entries.len())
    }

    /// Fresh push entry for `asset` if push may be used. Records the push
    /// outcome.
    fn push_candidate(&self, asset: &str, now: DateTime<Utc>) -> Option<BalanceEntry> {
        if self.is_push_disabled() {
            return None;
        }
        if self.channel.state() != ChannelState::Streaming {
            self.push_health.record_failure();
            return None;
        }
        self.push_health.record_success(Duration::ZERO);
        if self.push_health.status() != HealthStatus::Healthy {
            return None;
        }
        self.channel
            .entry(asset)
            .filter(|entry| now - entry.updated_at <= self.config.max_age())
    }

    fn push_usable(&self) -> bool {
        !self.is_push_disabled()
            && self.push_health.status() == HealthStatus::Healthy
            && self.channel.state() == ChannelState::Streaming
    }

    fn pull_eligible(&self) -> bool {
        self.pull_health.status() != HealthStatus::Failed && !self.pull_breaker.is_open()
    }

    fn draw_push(&self) -> bool {
        let ratio = self.config.push_ratio.clamp(0.0, 1.0);
        rand::thread_rng().gen_bool(ratio)
    }

    async fn fetch_pull(&self) -> std::result::Result<Vec<BalanceEntry>, ExchangeError> {
        self.pull_breaker.check()?;

        let started = Instant::now();
        let timeout = Duration::from_millis(self.config.pull_timeout_ms);
        let result = match tokio::time::timeout(timeout, self.pull.fetch_balances()).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout {
                duration_ms: self.config.pull_timeout_ms,
            }),
        };

        match result {
            Ok(entries) => {
                self.pull_health.record_success(started.elapsed());
                self.pull_breaker.record_success();
                self.merge_pull(&entries).await;
                Ok(entries)
            }
            Err(err) => {
                self.pull_health.record_failure();
                self.pull_breaker.record_failure();
                if matches!(err, ExchangeError::PermissionDenied { .. }) {
                    warn!(error = %err, "pull balances permission denied");
                } else {
                    debug!(error = %err, "pull balances failed");
                }
                Err(err)
            }
        }
    }

    async fn merge_pull(&self, entries: &[BalanceEntry]) {
        let mut cache = self.cache.lock().await;
        for entry in entries {
            cache.last_pull.insert(entry.asset.clone(), entry.clone());
            merge_entry(&mut cache.merged, entry);
        }
    }

    /// Validate, cross-check, cache and count one served entry.
    async fn serve(&self, entry: BalanceEntry, now: DateTime<Utc>) -> BalanceEntry {
        self.validator.check(&entry, now);

        let max_age = self.config.max_age();
        match entry.source {
            SourceTag::Push => {
                self.served.push.fetch_add(1, Ordering::Relaxed);
                let mut cache = self.cache.lock().await;
                if let Some(pull) = cache.last_pull.get(&entry.asset)
                    && now - pull.updated_at <= max_age
                {
                    self.validator.check_cross_source(&entry, pull);
                }
                merge_entry(&mut cache.merged, &entry);
            }
            SourceTag::Pull => {
                self.served.pull.fetch_add(1, Ordering::Relaxed);
                if let Some(push) = self.channel.entry(&entry.asset)
                    && now - push.updated_at <= max_age
                {
                    self.validator.check_cross_source(&push, &entry);
                }
            }
            SourceTag::Cache => {
                self.served.cache.fetch_add(1, Ordering::Relaxed);
            }
        }
        entry
    }

    /// One supervision pass: push staleness and reconnect, pull probe.
    pub async fn health_tick(&self, tokens: &TokenLifecycleManager) {
        if !self.is_push_disabled() {
            match self.channel.state() {
                ChannelState::PermissionDenied => self.disable_push("streaming permission denied"),
                ChannelState::Streaming => {
                    if self.channel.check_staleness() {
                        self.push_health.record_failure();
                    } else {
                        self.push_health.record_success(Duration::ZERO);
                    }
                }
                ChannelState::Connecting => {}
                ChannelState::Disconnected | ChannelState::Error { .. } => {
                    self.push_health.record_failure();
                    self.reconnect_push(tokens).await;
                }
            }
        }

        if self.pull_health.status() == HealthStatus::Failed && self.pull_breaker.allow() {
            match self.fetch_pull().await {
                Ok(entries) => debug!(assets = entries.len(), "pull probe succeeded"),
                Err(err) => debug!(error = %err, "pull probe failed"),
            }
        }
    }

    async fn reconnect_push(&self, tokens: &TokenLifecycleManager) {
        let now = Instant::now();
        {
            let next = self
                .next_reconnect
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if next.is_some_and(|at| now < at) {
                return;
            }
        }

        let result = match tokens.try_get_token(true).await {
            Ok(token) => self.channel.connect(&token.token).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                self.reconnect_failures.store(0, Ordering::Relaxed);
                *self
                    .next_reconnect
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
                info!("push channel reconnected");
            }
            Err(ExchangeError::PermissionDenied { message }) => {
                self.disable_push(&message);
            }
            Err(err) => {
                let failures = self.reconnect_failures.fetch_add(1, Ordering::Relaxed) + 1;
                let delay = self.config.reconnect.delay(failures);
                *self
                    .next_reconnect
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(now + delay);
                warn!(error = %err, failures, ?delay, "push reconnect failed");
            }
        }
    }

    pub fn spawn_health_loop(
        self: Arc<Self>,
        tokens: Arc<TokenLifecycleManager>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.config.health_interval_secs.max(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => self.health_tick(&tokens).await,
                }
            }
            debug!("router health loop stopped");
        })
    }

    pub async fn health_report(&self) -> RouterHealth {
        let cached_assets = self.cache.lock().await.merged.len();
        RouterHealth {
            push: self.push_health.snapshot(),
            pull: self.pull_health.snapshot(),
            push_disabled: self.is_push_disabled(),
            channel: self.channel.state(),
            pull_breaker: self.pull_breaker.status(),
            validation: self.validator.counters(),
            served: ServedCounters {
                push: self.served.push.load(Ordering::Relaxed),
                pull: self.served.pull.load(Ordering::Relaxed),
                cache: self.served.cache.load(Ordering::Relaxed),
                unavailable: self.served.unavailable.load(Ordering::Relaxed),
            },
            cached_assets,
        }
    }
}

/// Entries within `max_age`, plus the assets that are older.
fn split_by_age(
    snapshot: &HashMap<String, BalanceEntry>,
    now: DateTime<Utc>,
    max_age: chrono::Duration,
) -> (Vec<BalanceEntry>, HashSet<String>) {
    let mut current = Vec::new();
    let mut stale = HashSet::new();
    for entry in snapshot.values() {
        if now - entry.updated_at <= max_age {
            current.push(entry.clone());
        } else {
            stale.insert(entry.asset.clone());
        }
    }
    (current, stale)
}

/// Keep the newer of the cached and incoming values.
fn merge_entry(merged: &mut HashMap<String, BalanceEntry>, entry: &BalanceEntry) {
    match merged.get(&entry.asset) {
        Some(existing) if existing.updated_at > entry.updated_at => {}
        _ => {
            merged.insert(entry.asset.clone(), entry.clone());
        }
    }
}
