/*
[INPUT]:  TokenSource (REST token endpoint), NonceAuthority, persisted token
[OUTPUT]: Valid session tokens, refresh loop, auth-error recovery decisions
[POS]:    Auth layer - orchestrates the session token lifecycle
[UPDATE]: When refresh policy, breaker behavior or auth recovery rules change
*/

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::nonce::NonceAuthority;
use super::token::{AuthToken, TokenSource, TokenStore};
use crate::http::{AuthErrorKind, ExchangeError, Result};
use crate::retry::{BreakerStatus, CircuitBreaker, CircuitState, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// A token is usable while `now < expires_at - safety_margin`.
    pub safety_margin_secs: u64,
    /// Proactive refresh fires once remaining lifetime drops to this.
    pub refresh_margin_secs: u64,
    pub check_interval_secs: u64,
    pub fetch_timeout_ms: u64,
    pub breaker_cooldown_secs: u64,
    pub retry: RetryPolicy,
    /// Persisted token file. `None` disables persistence.
    pub token_path: Option<PathBuf>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: 120,
            refresh_margin_secs: 120,
            check_interval_secs: 60,
            fetch_timeout_ms: 10_000,
            breaker_cooldown_secs: 300,
            retry: RetryPolicy::default(),
            token_path: None,
        }
    }
}

impl TokenConfig {
    fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }

    fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    Unauthenticated,
    Valid,
    Refreshing,
    Failed,
}

/// What the caller of a rejected request should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRecovery {
    /// Nonce or token has been repaired; retry the request once.
    RetryOnce,
    /// Recovery failed or is not possible right now.
    GiveUp,
    /// Permission denied. Never retried.
    Terminal,
}

/// Read-only snapshot for supervisors.
#[derive(Debug, Clone, Serialize)]
pub struct TokenStatus {
    pub state: TokenState,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_count: u64,
    pub permission_denied: bool,
    pub last_error: Option<String>,
    pub breaker: BreakerStatus,
}

#[derive(Debug)]
struct TokenSlot {
    token: Option<AuthToken>,
    state: TokenState,
    last_error: Option<String>,
    issued: u64,
}

/// Owns the session token: single-flight refresh, retry with backoff, and a
/// breaker that stops refresh attempts after repeated failure.
pub struct TokenLifecycleManager {
    source: Arc<dyn TokenSource>,
    config: TokenConfig,
    store: Option<TokenStore>,
    nonces: Option<(Arc<NonceAuthority>, String)>,
    slot: RwLock<TokenSlot>,
    refresh_lock: Mutex<()>,
    generation: AtomicU64,
    fetches: AtomicU64,
    permission_denied: AtomicBool,
    breaker: CircuitBreaker,
}

impl std::fmt::Debug for TokenLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLifecycleManager")
            .field("config", &self.config)
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl TokenLifecycleManager {
    /// Build the manager, reusing a persisted token that is still usable.
    pub fn new(source: Arc<dyn TokenSource>, config: TokenConfig) -> Self {
        let store = config.token_path.clone().map(TokenStore::new);
        let restored = store
            .as_ref()
            .and_then(TokenStore::load)
            .filter(|token| token.is_usable(config.safety_margin()));

        let state = match &restored {
            Some(token) => {
                info!(
                    expires_at = %token.expires_at,
                    refresh_count = token.refresh_count,
                    "reusing persisted session token"
                );
                TokenState::Valid
            }
            None => TokenState::Unauthenticated,
        };

        let breaker = CircuitBreaker::new(
            "token_refresh",
            config.retry.max_attempts.max(1),
            Duration::from_secs(config.breaker_cooldown_secs),
        );

        Self {
            source,
            store,
            nonces: None,
            slot: RwLock::new(TokenSlot {
                issued: restored.as_ref().map(|token| token.refresh_count + 1).unwrap_or(0),
                token: restored,
                state,
                last_error: None,
            }),
            refresh_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            permission_denied: AtomicBool::new(false),
            breaker,
            config,
        }
    }

    /// Enable nonce recovery in [`handle_auth_error`](Self::handle_auth_error).
    pub fn with_nonce_recovery(mut self, nonces: Arc<NonceAuthority>, key_id: impl Into<String>) -> Self {
        self.nonces = Some((nonces, key_id.into()));
        self
    }

    fn read_slot<T>(&self, f: impl FnOnce(&TokenSlot) -> T) -> T {
        let slot = self.slot.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&slot)
    }

    fn write_slot<T>(&self, f: impl FnOnce(&mut TokenSlot) -> T) -> T {
        let mut slot = self.slot.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut slot)
    }

    fn usable_token(&self) -> Option<AuthToken> {
        let margin = self.config.safety_margin();
        self.read_slot(|slot| slot.token.clone().filter(|token| token.is_usable(margin)))
    }

    /// Cached token if usable, otherwise the result of a (shared) refresh.
    ///
    /// `None` while the breaker is open or after permission was denied;
    /// no network call is made in either case.
    pub async fn get_token(&self, force_refresh: bool) -> Option<AuthToken> {
        match self.try_get_token(force_refresh).await {
            Ok(token) => Some(token),
            Err(err) => {
                debug!(error = %err, "no session token available");
                None
            }
        }
    }

    pub async fn try_get_token(&self, force_refresh: bool) -> Result<AuthToken> {
        self.ensure_permitted()?;
        if !force_refresh && let Some(token) = self.usable_token() {
            return Ok(token);
        }
        self.breaker.check()?;

        let observed = self.generation.load(Ordering::SeqCst);
        let _guard = self.refresh_lock.lock().await;

        if self.generation.load(Ordering::SeqCst) != observed {
            // Another caller refreshed while we waited; reuse its outcome.
            if let Some(token) = self.usable_token() {
                return Ok(token);
            }
            self.ensure_permitted()?;
            self.breaker.check()?;
            let message = self
                .read_slot(|slot| slot.last_error.clone())
                .unwrap_or_else(|| "token refresh failed".to_string());
            return Err(ExchangeError::Authentication { message });
        }

        self.refresh_locked().await
    }

    /// Refresh when the remaining lifetime is within the refresh margin.
    ///
    /// Returns whether a new token was obtained. Concurrent callers share a
    /// single outbound request.
    pub async fn refresh_proactively(&self) -> Result<bool> {
        let margin = self.config.refresh_margin();
        let now = Utc::now();
        let due = self.read_slot(|slot| match &slot.token {
            Some(token) => token.remaining_at(now) <= margin,
            None => true,
        });
        if !due {
            return Ok(false);
        }

        let before = self.generation.load(Ordering::SeqCst);
        self.try_get_token(true).await?;
        Ok(self.generation.load(Ordering::SeqCst) != before)
    }

    /// Must be called with `refresh_lock` held.
    async fn refresh_locked(&self) -> Result<AuthToken> {
        let half_open = self.breaker.state() == CircuitState::HalfOpen;
        self.write_slot(|slot| slot.state = TokenState::Refreshing);

        let policy = if half_open {
            RetryPolicy {
                max_attempts: 1,
                ..self.config.retry
            }
        } else {
            self.config.retry
        };
        let timeout = Duration::from_millis(self.config.fetch_timeout_ms);

        let outcome = policy
            .retry(
                "token_refresh",
                |attempt| {
                    let source = self.source.clone();
                    self.fetches.fetch_add(1, Ordering::SeqCst);
                    async move {
                        debug!(attempt, "fetching session token");
                        match tokio::time::timeout(timeout, source.fetch_token()).await {
                            Ok(result) => result,
                            Err(_) => Err(ExchangeError::Timeout {
                                duration_ms: timeout.as_millis() as u64,
                            }),
                        }
                    }
                },
                ExchangeError::is_retryable,
            )
            .await;

        let result = match outcome {
            Ok(grant) => {
                let token = self.write_slot(|slot| {
                    let token = AuthToken::new(grant.token, Utc::now(), grant.lifetime, slot.issued);
                    slot.issued += 1;
                    slot.token = Some(token.clone());
                    slot.state = TokenState::Valid;
                    slot.last_error = None;
                    token
                });
                self.breaker.record_success();
                info!(
                    expires_at = %token.expires_at,
                    refresh_count = token.refresh_count,
                    "session token refreshed"
                );
                self.persist(&token).await;
                Ok(token)
            }
            Err(err) => {
                self.record_refresh_failure(&err);
                Err(err)
            }
        };

        self.generation.fetch_add(1, Ordering::SeqCst);
        result
    }

    fn record_refresh_failure(&self, err: &ExchangeError) {
        if matches!(err, ExchangeError::PermissionDenied { .. }) {
            self.mark_permission_denied(err.to_string());
            return;
        }
        self.write_slot(|slot| {
            slot.state = TokenState::Failed;
            slot.last_error = Some(err.to_string());
        });
        self.breaker.trip();
        warn!(
            error = %err,
            cooldown_secs = self.config.breaker_cooldown_secs,
            "token refresh failed, pausing refresh attempts"
        );
    }

    fn mark_permission_denied(&self, message: String) {
        if !self.permission_denied.swap(true, Ordering::SeqCst) {
            warn!(reason = %message, "permission denied, token refresh disabled");
        }
        self.write_slot(|slot| {
            slot.state = TokenState::Failed;
            slot.token = None;
            slot.last_error = Some(message);
        });
    }

    fn ensure_permitted(&self) -> Result<()> {
        if self.permission_denied.load(Ordering::SeqCst) {
            let message = self
                .read_slot(|slot| slot.last_error.clone())
                .unwrap_or_else(|| "permission denied".to_string());
            return Err(ExchangeError::PermissionDenied { message });
        }
        Ok(())
    }

    async fn persist(&self, token: &AuthToken) {
        if let Some(store) = &self.store
            && let Err(err) = store.save(token).await
        {
            warn!(error = %err, "failed to persist session token");
        }
    }

    /// Decide how to recover from an auth failure reported by a caller.
    pub async fn handle_auth_error(&self, kind: AuthErrorKind) -> AuthRecovery {
        match kind {
            AuthErrorKind::InvalidNonce => {
                let Some((nonces, key_id)) = &self.nonces else {
                    warn!("nonce rejected but no nonce authority attached");
                    return AuthRecovery::GiveUp;
                };
                match nonces.recover_from_error(key_id).await {
                    Ok(_) => AuthRecovery::RetryOnce,
                    Err(err) => {
                        warn!(error = %err, "nonce recovery failed");
                        AuthRecovery::GiveUp
                    }
                }
            }
            AuthErrorKind::TokenExpired => {
                // Drop the rejected token so nobody else reuses it.
                self.write_slot(|slot| slot.token = None);
                match self.try_get_token(true).await {
                    Ok(_) => AuthRecovery::RetryOnce,
                    Err(ExchangeError::PermissionDenied { .. }) => AuthRecovery::Terminal,
                    Err(err) => {
                        warn!(error = %err, "forced token refresh failed");
                        AuthRecovery::GiveUp
                    }
                }
            }
            AuthErrorKind::PermissionDenied => {
                self.mark_permission_denied("permission denied by exchange".to_string());
                AuthRecovery::Terminal
            }
            AuthErrorKind::InvalidSignature => {
                self.write_slot(|slot| slot.last_error = Some("invalid signature".to_string()));
                if self.breaker.record_failure() {
                    self.write_slot(|slot| slot.state = TokenState::Failed);
                }
                AuthRecovery::GiveUp
            }
        }
    }

    /// Background loop that keeps the token fresh until `shutdown` fires.
    pub fn spawn_refresh_loop(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.check_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("token refresh loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.refresh_proactively().await {
                            Ok(true) => debug!("proactive token refresh completed"),
                            Ok(false) => {}
                            Err(ExchangeError::CircuitOpen { remaining_secs, .. }) => {
                                debug!(remaining_secs, "token refresh paused by breaker");
                            }
                            Err(err) => warn!(error = %err, "proactive token refresh failed"),
                        }
                    }
                }
            }
        })
    }

    pub fn state(&self) -> TokenState {
        self.read_slot(|slot| slot.state)
    }

    pub fn is_permission_denied(&self) -> bool {
        self.permission_denied.load(Ordering::SeqCst)
    }

    /// Number of outbound token requests made so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> TokenStatus {
        let (state, expires_at, refresh_count, last_error) = self.read_slot(|slot| {
            (
                slot.state,
                slot.token.as_ref().map(|token| token.expires_at),
                slot.token.as_ref().map(|token| token.refresh_count).unwrap_or(0),
                slot.last_error.clone(),
            )
        });
        TokenStatus {
            state,
            expires_at,
            refresh_count,
            permission_denied: self.is_permission_denied(),
            last_error,
            breaker: self.breaker.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use tokio_test::assert_ok;
    use uuid::Uuid;

    use crate::auth::TokenGrant;

    struct CountingSource {
        calls: AtomicU32,
        delay: Duration,
        failure: Option<fn() -> ExchangeError>,
    }

    impl CountingSource {
        fn ok(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                delay,
                failure: None,
            })
        }

        fn failing(failure: fn() -> ExchangeError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
                failure: Some(failure),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch_token(&self) -> Result<TokenGrant> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.failure {
                Some(failure) => Err(failure()),
                None => Ok(TokenGrant {
                    token: format!("token-{call}"),
                    lifetime: Duration::from_secs(900),
                }),
            }
        }
    }

    #[tokio::test]
    async fn first_call_fetches_then_caches() {
        let source = CountingSource::ok(Duration::ZERO);
        let manager = TokenLifecycleManager::new(source.clone(), TokenConfig::default());
        assert_eq!(manager.state(), TokenState::Unauthenticated);

        let first = assert_ok!(manager.try_get_token(false).await);
        let second = assert_ok!(manager.try_get_token(false).await);

        assert_eq!(first.token, "token-1");
        assert_eq!(second.token, "token-1");
        assert_eq!(source.calls(), 1);
        assert_eq!(manager.state(), TokenState::Valid);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_refresh() {
        let source = CountingSource::ok(Duration::from_millis(200));
        let manager = Arc::new(TokenLifecycleManager::new(
            source.clone(),
            TokenConfig::default(),
        ));

        let a = tokio::spawn({
            let manager = manager.clone();
            async move { manager.refresh_proactively().await }
        });
        let b = tokio::spawn({
            let manager = manager.clone();
            async move { manager.refresh_proactively().await }
        });

        assert!(a.await.unwrap().unwrap() || b.await.unwrap().unwrap());
        assert_eq!(source.calls(), 1);
        assert_eq!(manager.fetch_count(), 1);
    }

    #[tokio::test]
    async fn proactive_refresh_skips_fresh_token() {
        let source = CountingSource::ok(Duration::ZERO);
        let manager = TokenLifecycleManager::new(source.clone(), TokenConfig::default());

        assert!(manager.refresh_proactively().await.unwrap());
        assert!(!manager.refresh_proactively().await.unwrap());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_after_retries_and_blocks_network() {
        let source = CountingSource::failing(|| ExchangeError::Timeout { duration_ms: 10 });
        let manager = TokenLifecycleManager::new(source.clone(), TokenConfig::default());

        assert!(manager.get_token(false).await.is_none());
        assert_eq!(source.calls(), 3);
        assert_eq!(manager.state(), TokenState::Failed);

        assert!(manager.get_token(false).await.is_none());
        assert!(matches!(
            manager.try_get_token(true).await,
            Err(ExchangeError::CircuitOpen { .. })
        ));
        assert_eq!(source.calls(), 3);

        tokio::time::advance(Duration::from_secs(301)).await;

        // Half-open probe is a single attempt.
        assert!(manager.get_token(false).await.is_none());
        assert_eq!(source.calls(), 4);
        assert_eq!(manager.status().breaker.trips, 2);
    }

    #[tokio::test]
    async fn permission_denied_is_terminal() {
        let source = CountingSource::failing(|| ExchangeError::PermissionDenied {
            message: "EGeneral:Permission denied".to_string(),
        });
        let manager = TokenLifecycleManager::new(source.clone(), TokenConfig::default());

        assert!(matches!(
            manager.try_get_token(false).await,
            Err(ExchangeError::PermissionDenied { .. })
        ));
        assert_eq!(source.calls(), 1);

        assert!(manager.get_token(true).await.is_none());
        assert_eq!(source.calls(), 1);
        assert!(manager.status().permission_denied);
    }

    #[tokio::test]
    async fn persisted_token_is_reused_on_construction() {
        let dir = std::env::temp_dir().join(format!("exlink-manager-{}", Uuid::new_v4()));
        let config = TokenConfig {
            token_path: Some(dir.join("token.json")),
            ..Default::default()
        };

        let first_source = CountingSource::ok(Duration::ZERO);
        let first = TokenLifecycleManager::new(first_source.clone(), config.clone());
        let issued = assert_ok!(first.try_get_token(false).await);

        let second_source = CountingSource::ok(Duration::ZERO);
        let second = TokenLifecycleManager::new(second_source.clone(), config);
        assert_eq!(second.state(), TokenState::Valid);
        let reused = assert_ok!(second.try_get_token(false).await);

        assert_eq!(reused.token, issued.token);
        assert_eq!(second_source.calls(), 0);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn expired_token_error_forces_refresh() {
        let source = CountingSource::ok(Duration::ZERO);
        let manager = TokenLifecycleManager::new(source.clone(), TokenConfig::default());
        assert_ok!(manager.try_get_token(false).await);

        let recovery = manager.handle_auth_error(AuthErrorKind::TokenExpired).await;

        assert_eq!(recovery, AuthRecovery::RetryOnce);
        assert_eq!(source.calls(), 2);
        let token = manager.get_token(false).await.unwrap();
        assert_eq!(token.token, "token-2");
        assert_eq!(token.refresh_count, 1);
    }

    #[tokio::test]
    async fn nonce_error_recovers_through_authority() {
        let nonces = Arc::new(NonceAuthority::in_memory());
        let before = nonces.issue("key").await.unwrap();
        let manager = TokenLifecycleManager::new(
            CountingSource::ok(Duration::ZERO),
            TokenConfig::default(),
        )
        .with_nonce_recovery(nonces.clone(), "key");

        let recovery = manager.handle_auth_error(AuthErrorKind::InvalidNonce).await;

        assert_eq!(recovery, AuthRecovery::RetryOnce);
        assert!(nonces.last_issued("key").await.unwrap() >= before + 5_000_000);
    }

    #[tokio::test]
    async fn repeated_invalid_signatures_open_breaker() {
        let source = CountingSource::ok(Duration::ZERO);
        let manager = TokenLifecycleManager::new(source.clone(), TokenConfig::default());

        for _ in 0..3 {
            assert_eq!(
                manager.handle_auth_error(AuthErrorKind::InvalidSignature).await,
                AuthRecovery::GiveUp
            );
        }

        assert!(manager.get_token(false).await.is_none());
        assert_eq!(source.calls(), 0);
        assert_eq!(manager.state(), TokenState::Failed);
    }
}
