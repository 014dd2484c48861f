/*
[INPUT]:  CoreConfig, request signer, shutdown token
[OUTPUT]: Wired nonce/token/channel/router/order components and their background tasks
[POS]:    Composition root - process-wide connectivity core
[UPDATE]: When adding components, changing construction order, or task supervision
*/

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use exlink_adapter::{
    Credentials, ExchangeClient, NonceAuthority, OrderGateway, PrivateWebSocket, RequestSigner,
    TokenLifecycleManager, TokenStatus,
};

use crate::balance::RealtimeBalanceChannel;
use crate::config::CoreConfig;
use crate::orders::{OrderHealth, OrderLifecycleManager};
use crate::router::{ConnectivityRouter, RouterHealth};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
pub struct CoreHealth {
    pub token: TokenStatus,
    pub router: RouterHealth,
    pub orders: OrderHealth,
}

/// One instance per process. Owns every connectivity component and the
/// background tasks that keep them alive.
pub struct ConnectivityCore {
    config: CoreConfig,
    nonces: Arc<NonceAuthority>,
    client: Arc<ExchangeClient>,
    tokens: Arc<TokenLifecycleManager>,
    channel: Arc<RealtimeBalanceChannel>,
    router: Arc<ConnectivityRouter>,
    orders: Arc<OrderLifecycleManager>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl std::fmt::Debug for ConnectivityCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityCore")
            .field("client", &self.client)
            .field("channel", &self.channel)
            .field("orders", &self.orders)
            .finish_non_exhaustive()
    }
}

impl ConnectivityCore {
    /// Build every component. Nothing touches the network until [`start`].
    ///
    /// [`start`]: ConnectivityCore::start
    pub fn new(config: CoreConfig, signer: Arc<dyn RequestSigner>) -> Result<Self> {
        let nonces = Arc::new(
            NonceAuthority::load(config.nonce.clone()).context("load nonce state")?,
        );
        let key_id = config.exchange.effective_key_id().to_string();
        let credentials = Credentials {
            api_key: config.exchange.api_key.clone(),
            key_id: key_id.clone(),
        };
        let client = Arc::new(
            ExchangeClient::new(
                config.exchange.rest.clone(),
                credentials,
                signer,
                nonces.clone(),
            )
            .context("build REST client")?,
        );

        let tokens = Arc::new(
            TokenLifecycleManager::new(client.clone(), config.token.clone())
                .with_nonce_recovery(nonces.clone(), key_id),
        );

        // One session serves both the balance stream and WS order entry.
        let ws = PrivateWebSocket::new(config.exchange.ws.clone());
        let ws_gateway: Arc<dyn OrderGateway> = Arc::new(ws.clone());
        let channel = Arc::new(RealtimeBalanceChannel::new(ws, config.channel.clone()));

        let router = Arc::new(ConnectivityRouter::new(
            config.router.clone(),
            channel.clone(),
            client.clone(),
        ));
        let orders = Arc::new(OrderLifecycleManager::new(
            Some(ws_gateway),
            client.clone(),
            config.orders.clone(),
        ));

        Ok(Self {
            config,
            nonces,
            client,
            tokens,
            channel,
            router,
            orders,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn background tasks and kick off the first push connection.
    /// A failed first connect is retried by the router health loop.
    pub fn start(&self) {
        let mut tasks = self.lock_tasks();
        if !tasks.is_empty() {
            warn!("connectivity core already started");
            return;
        }

        tasks.push((
            "token_refresh",
            self.tokens.clone().spawn_refresh_loop(self.shutdown.clone()),
        ));

        let channel = self.channel.clone();
        let shutdown = self.shutdown.clone();
        tasks.push((
            "balance_channel",
            tokio::spawn(async move { channel.run(shutdown).await }),
        ));

        let channel = self.channel.clone();
        let tokens = self.tokens.clone();
        let shutdown = self.shutdown.clone();
        tasks.push((
            "initial_connect",
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = connect_push(&channel, &tokens) => {}
                }
            }),
        ));

        tasks.push((
            "router_health",
            self.router
                .clone()
                .spawn_health_loop(self.tokens.clone(), self.shutdown.clone()),
        ));
        tasks.push((
            "order_reports",
            self.orders
                .clone()
                .spawn_report_pump(self.channel.subscribe_executions(), self.shutdown.clone()),
        ));
        tasks.push((
            "order_maintenance",
            self.orders.clone().spawn_maintenance(self.shutdown.clone()),
        ));
        tasks.push((
            "execution_gaps",
            self.orders
                .clone()
                .spawn_gap_watch(self.channel.subscribe_gaps(), self.shutdown.clone()),
        ));

        info!(tasks = tasks.len(), "connectivity core started");
    }

    /// Cancel every task and wait for them, aborting stragglers at the deadline.
    pub async fn shutdown_and_wait(&self) -> Result<()> {
        self.shutdown.cancel();
        let result = self.join_all_with_deadline(SHUTDOWN_TIMEOUT).await;
        self.channel.disconnect().await;
        result
    }

    async fn join_all_with_deadline(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut tasks = std::mem::take(&mut *self.lock_tasks());

        while let Some((name, mut handle)) = tasks.pop() {
            tokio::select! {
                res = &mut handle => {
                    if let Err(join_err) = res {
                        abort_all(tasks);
                        if join_err.is_panic() {
                            return Err(anyhow!("task panicked task={name}: {join_err}"));
                        }
                        return Err(anyhow!("task join error task={name}: {join_err}"));
                    }
                    debug!(task = name, "task stopped");
                }
                _ = sleep_until(deadline) => {
                    handle.abort();
                    abort_all(tasks);
                    return Err(anyhow!("shutdown timed out after {timeout:?}"));
                }
            }
        }

        Ok(())
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<(&'static str, JoinHandle<()>)>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn health_report(&self) -> CoreHealth {
        CoreHealth {
            token: self.tokens.status(),
            router: self.router.health_report().await,
            orders: self.orders.health().await,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn nonces(&self) -> &Arc<NonceAuthority> {
        &self.nonces
    }

    pub fn client(&self) -> &Arc<ExchangeClient> {
        &self.client
    }

    pub fn tokens(&self) -> &Arc<TokenLifecycleManager> {
        &self.tokens
    }

    pub fn channel(&self) -> &Arc<RealtimeBalanceChannel> {
        &self.channel
    }

    pub fn router(&self) -> &Arc<ConnectivityRouter> {
        &self.router
    }

    pub fn orders(&self) -> &Arc<OrderLifecycleManager> {
        &self.orders
    }
}

async fn connect_push(channel: &RealtimeBalanceChannel, tokens: &TokenLifecycleManager) {
    match tokens.try_get_token(false).await {
        Ok(token) => {
            if let Err(err) = channel.connect(&token.token).await {
                warn!(error = %err, "initial balance channel connect failed; serving from pull");
            }
        }
        Err(err) => {
            warn!(error = %err, "no websocket token; serving balances from pull");
        }
    }
}

fn abort_all(tasks: Vec<(&'static str, JoinHandle<()>)>) {
    for (_, handle) in tasks {
        handle.abort();
    }
}
