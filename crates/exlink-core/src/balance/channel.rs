/*
[INPUT]:  PrivateWebSocket session + current auth token
[OUTPUT]: Latest push balances via `watch`, change annotations and execution reports via `broadcast`
[POS]:    Data layer - push side of balance routing (no selection logic)
[UPDATE]: When changing subscription steps, staleness handling, or payload normalization
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use exlink_adapter::{
    BalanceEntry, ExchangeError, ExecutionReport, MessageKind, PrivateWebSocket, SourceTag,
    WebSocketMessage, WsEvent, normalize_balances, parse_execution_reports,
};

use super::QuoteAliases;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Silence longer than this moves a streaming channel to `Error`.
    pub stale_threshold_secs: u64,
    pub change_capacity: usize,
    pub execution_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            stale_threshold_secs: 120,
            change_capacity: 256,
            execution_capacity: 1024,
        }
    }
}

impl ChannelConfig {
    fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Streaming,
    Error { reason: String },
    /// The key lacks streaming entitlement. Terminal.
    PermissionDenied,
}

/// Advisory classification of a balance move. A losing trade can still raise
/// one leg, so this is never authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    DepositOrProfit,
    WithdrawalOrLoss,
    Unchanged,
}

impl ChangeKind {
    fn from_delta(delta: Decimal) -> Self {
        if delta > Decimal::ZERO {
            ChangeKind::DepositOrProfit
        } else if delta < Decimal::ZERO {
            ChangeKind::WithdrawalOrLoss
        } else {
            ChangeKind::Unchanged
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceChange {
    pub asset: String,
    pub previous: Option<Decimal>,
    pub current: Decimal,
    pub delta: Decimal,
    pub kind: ChangeKind,
    pub at: DateTime<Utc>,
}

pub type BalanceMap = Arc<HashMap<String, BalanceEntry>>;

/// Push-side balance cache fed by the private WebSocket.
///
/// Reconnecting is left to the router, which refreshes the token first.
pub struct RealtimeBalanceChannel {
    ws: PrivateWebSocket,
    config: ChannelConfig,
    events: StdMutex<Option<mpsc::Receiver<WsEvent>>>,
    balances: Mutex<HashMap<String, BalanceEntry>>,
    balances_tx: watch::Sender<BalanceMap>,
    state_tx: watch::Sender<ChannelState>,
    changes_tx: broadcast::Sender<BalanceChange>,
    executions_tx: broadcast::Sender<ExecutionReport>,
    /// Count of points where execution reports may have been lost.
    gaps_tx: watch::Sender<u64>,
    drops_seen: AtomicU64,
    last_message: StdMutex<Option<Instant>>,
}

impl std::fmt::Debug for RealtimeBalanceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeBalanceChannel")
            .field("state", &*self.state_tx.borrow())
            .field("assets", &self.balances_tx.borrow().len())
            .finish_non_exhaustive()
    }
}

impl RealtimeBalanceChannel {
    pub fn new(ws: PrivateWebSocket, config: ChannelConfig) -> Self {
        let events = ws.take_receiver();
        if events.is_none() {
            warn!("websocket event receiver already taken; push balances will not flow");
        }
        let (balances_tx, _) = watch::channel(Arc::new(HashMap::new()));
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let (changes_tx, _) = broadcast::channel(config.change_capacity.max(1));
        let (executions_tx, _) = broadcast::channel(config.execution_capacity.max(1));
        let (gaps_tx, _) = watch::channel(0);

        Self {
            ws,
            config,
            events: StdMutex::new(events),
            balances: Mutex::new(HashMap::new()),
            balances_tx,
            state_tx,
            changes_tx,
            executions_tx,
            gaps_tx,
            drops_seen: AtomicU64::new(0),
            last_message: StdMutex::new(None),
        }
    }

    pub fn websocket(&self) -> &PrivateWebSocket {
        &self.ws
    }

    /// Connect, authenticate, then subscribe to balances (with snapshot) and
    /// executions. Any open session is closed first.
    pub async fn connect(&self, token: &str) -> Result<(), ExchangeError> {
        if self.state() == ChannelState::PermissionDenied {
            return Err(ExchangeError::PermissionDenied {
                message: "balance streaming not permitted for this key".to_string(),
            });
        }

        self.ws.close().await;
        self.set_state(ChannelState::Connecting);

        let result = async {
            self.ws.connect().await?;
            self.ws.authenticate(token).await?;
            self.ws.subscribe("balances", true).await?;
            self.ws.subscribe("executions", false).await
        }
        .await;

        match result {
            Ok(()) => {
                self.touch();
                self.set_state(ChannelState::Streaming);
                info!("balance channel streaming");
                Ok(())
            }
            Err(err) => {
                self.ws.close().await;
                if matches!(err, ExchangeError::PermissionDenied { .. }) {
                    warn!(error = %err, "balance streaming permission denied");
                    self.set_state(ChannelState::PermissionDenied);
                } else {
                    warn!(error = %err, "balance channel connect failed");
                    self.set_state(ChannelState::Error {
                        reason: err.to_string(),
                    });
                }
                Err(err)
            }
        }
    }

    pub async fn disconnect(&self) {
        self.ws.close().await;
        if self.state() != ChannelState::PermissionDenied {
            self.set_state(ChannelState::Disconnected);
        }
    }

    /// Apply one session event.
    pub async fn ingest(&self, event: WsEvent) {
        match event {
            WsEvent::Message(message) => {
                self.touch();
                let dropped = self.ws.dropped_events();
                if dropped > self.drops_seen.swap(dropped, Ordering::Relaxed) {
                    self.record_gap("websocket events dropped");
                }
                match message {
                    WebSocketMessage::Balances { kind, data } => {
                        self.apply_balances(kind, &data).await;
                    }
                    WebSocketMessage::Executions { data, .. } => {
                        let (reports, skipped) = parse_execution_reports(&data);
                        if skipped > 0 {
                            warn!(skipped, "skipped unparseable execution reports");
                        }
                        for report in reports {
                            // No receivers is fine.
                            let _ = self.executions_tx.send(report);
                        }
                    }
                    WebSocketMessage::Heartbeat | WebSocketMessage::Status { .. } => {}
                    WebSocketMessage::Other => {}
                }
            }
            WsEvent::Disconnected { reason } => {
                // A late event from a replaced session.
                if self.ws.is_connected().await {
                    debug!(reason = %reason, "ignoring disconnect from previous session");
                    return;
                }
                self.record_gap("websocket disconnected");
                if self.state() != ChannelState::PermissionDenied {
                    self.set_state(ChannelState::Error { reason });
                }
            }
        }
    }

    fn record_gap(&self, cause: &str) {
        self.gaps_tx.send_modify(|gaps| *gaps += 1);
        debug!(cause, gaps = *self.gaps_tx.borrow(), "execution stream gap");
    }

    /// Gap counter; bumps whenever execution reports may have been missed.
    pub fn subscribe_gaps(&self) -> watch::Receiver<u64> {
        self.gaps_tx.subscribe()
    }

    async fn apply_balances(&self, kind: MessageKind, data: &serde_json::Value) {
        let now = Utc::now();
        let entries = normalize_balances(data, SourceTag::Push, now);

        let mut balances = self.balances.lock().await;
        let previous = if kind == MessageKind::Snapshot {
            std::mem::take(&mut *balances)
        } else {
            balances.clone()
        };

        for entry in entries {
            let prior = previous.get(&entry.asset).map(|prior| prior.total);
            let delta = entry.total - prior.unwrap_or(Decimal::ZERO);
            if prior.is_some() || kind != MessageKind::Snapshot {
                let change = BalanceChange {
                    asset: entry.asset.clone(),
                    previous: prior,
                    current: entry.total,
                    delta,
                    kind: ChangeKind::from_delta(delta),
                    at: now,
                };
                if change.kind != ChangeKind::Unchanged {
                    debug!(asset = %change.asset, delta = %change.delta, kind = ?change.kind, "balance change");
                }
                let _ = self.changes_tx.send(change);
            }
            balances.insert(entry.asset.clone(), entry);
        }

        self.balances_tx.send_replace(Arc::new(balances.clone()));
        drop(balances);

        let state = self.state();
        if state != ChannelState::Streaming && state != ChannelState::PermissionDenied {
            self.set_state(ChannelState::Streaming);
        }
    }

    /// Move a silent streaming channel to `Error`. Returns true on transition.
    pub fn check_staleness(&self) -> bool {
        if self.state() != ChannelState::Streaming {
            return false;
        }
        let Some(silence) = self.silence() else {
            return false;
        };
        if silence > self.config.stale_threshold() {
            warn!(silence_secs = silence.as_secs(), "balance channel stale");
            self.set_state(ChannelState::Error {
                reason: format!("no messages for {}s", silence.as_secs()),
            });
            return true;
        }
        false
    }

    /// Time since the last inbound message.
    pub fn silence(&self) -> Option<Duration> {
        self.last_message
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map(|at| at.elapsed())
    }

    /// Event pump plus heartbeat monitor. Runs until `shutdown`.
    pub async fn run(&self, shutdown: CancellationToken) {
        let receiver = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut events) = receiver else {
            warn!("balance channel pump already running or receiver missing");
            return;
        };

        let period = (self.config.stale_threshold() / 4).clamp(Duration::from_secs(1), Duration::from_secs(10));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => {
                    match event {
                        Some(event) => self.ingest(event).await,
                        None => {
                            warn!("websocket event stream ended");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.check_staleness();
                }
            }
        }

        self.disconnect().await;
        debug!("balance channel pump stopped");
    }

    pub fn snapshot(&self) -> BalanceMap {
        self.balances_tx.borrow().clone()
    }

    pub fn entry(&self, asset: &str) -> Option<BalanceEntry> {
        self.balances_tx.borrow().get(&asset.to_ascii_uppercase()).cloned()
    }

    pub fn subscribe_balances(&self) -> watch::Receiver<BalanceMap> {
        self.balances_tx.subscribe()
    }

    pub fn state(&self) -> ChannelState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<BalanceChange> {
        self.changes_tx.subscribe()
    }

    pub fn subscribe_executions(&self) -> broadcast::Receiver<ExecutionReport> {
        self.executions_tx.subscribe()
    }

    /// Aggregated quote-currency entry over the push cache.
    pub fn quote_total(&self, aliases: &QuoteAliases) -> Option<BalanceEntry> {
        let balances = self.snapshot();
        aliases.aggregate(balances.values())
    }

    fn touch(&self) {
        *self
            .last_message
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
    }

    fn set_state(&self, state: ChannelState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(from = ?current, to = ?state, "balance channel state");
                *current = state;
                true
            }
        });
    }
}
