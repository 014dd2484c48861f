/*
[INPUT]:  Test scenarios needing balance sources, order gateways, token sources
[OUTPUT]: Scriptable in-process doubles and fixture builders
[POS]:    Test infrastructure - shared across exlink-core integration tests
[UPDATE]: When adding new test patterns or fixtures
*/

#![allow(dead_code)]

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use exlink_adapter::{
    AmendAck, AmendRequest, BalanceEntry, BalanceSource, CancelAck, ExchangeError,
    ExecutionReport, MessageKind, OrderAck, OrderGateway, OrderIntent, OrderRef,
    PrivateWebSocket, Result, Side, SourceTag, TokenGrant, TokenSource, WebSocketMessage,
    WsConfig, WsEvent,
};
use exlink_core::balance::{ChannelConfig, RealtimeBalanceChannel};

pub fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap()
}

pub fn entry(asset: &str, total: &str, age_secs: i64, source: SourceTag) -> BalanceEntry {
    entry_at(asset, total, Utc::now() - chrono::Duration::seconds(age_secs), source)
}

pub fn entry_at(asset: &str, total: &str, at: DateTime<Utc>, source: SourceTag) -> BalanceEntry {
    BalanceEntry::new(asset, dec(total), Decimal::ZERO, at, source).unwrap()
}

pub fn limit_intent(cl_ord_id: &str) -> OrderIntent {
    OrderIntent::limit(cl_ord_id, "BTC/USD", Side::Buy, dec("0.01"), dec("50000"))
}

/// Channel pointed at a closed local port; balances are fed through `ingest`.
pub fn offline_channel() -> Arc<RealtimeBalanceChannel> {
    let config = WsConfig {
        url: "ws://127.0.0.1:9".to_string(),
        connect_timeout_ms: 500,
        request_timeout_ms: 500,
        ..WsConfig::default()
    };
    Arc::new(RealtimeBalanceChannel::new(
        PrivateWebSocket::new(config),
        ChannelConfig::default(),
    ))
}

/// Channel already streaming the given snapshot.
pub async fn streaming_channel(snapshot: Value) -> Arc<RealtimeBalanceChannel> {
    let channel = offline_channel();
    channel
        .ingest(WsEvent::Message(WebSocketMessage::Balances {
            kind: MessageKind::Snapshot,
            data: snapshot,
        }))
        .await;
    channel
}

enum PullMode {
    Up(Vec<BalanceEntry>),
    Down,
}

/// Pull source returning a fixed set of balances until switched off.
pub struct MockBalances {
    mode: Mutex<PullMode>,
    calls: AtomicUsize,
}

impl MockBalances {
    pub fn up(entries: Vec<BalanceEntry>) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(PullMode::Up(entries)),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn down() -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(PullMode::Down),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_up(&self, entries: Vec<BalanceEntry>) {
        *self.mode.lock().unwrap() = PullMode::Up(entries);
    }

    pub fn set_down(&self) {
        *self.mode.lock().unwrap() = PullMode::Down;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BalanceSource for MockBalances {
    async fn fetch_balances(&self) -> Result<Vec<BalanceEntry>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &*self.mode.lock().unwrap() {
            PullMode::Up(entries) => Ok(entries.clone()),
            PullMode::Down => Err(ExchangeError::Unavailable("pull down".to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayMode {
    Accept,
    /// Fails like a dropped connection.
    Down,
    /// Definitive exchange rejection with this text.
    Reject(String),
    /// First add accepted, later adds rejected with this text.
    AcceptThenReject(String),
}

/// Order gateway double. Acks use `O-<cl_ord_id>` so both transports agree
/// on the exchange id.
pub struct MockGateway {
    name: &'static str,
    mode: Mutex<GatewayMode>,
    delay: Mutex<Option<Duration>>,
    batch_supported: bool,
    query_reports: Mutex<Vec<ExecutionReport>>,
    pub adds: AtomicUsize,
    pub cancels: AtomicUsize,
    pub amends: AtomicUsize,
    pub batches: AtomicUsize,
}

impl MockGateway {
    pub fn new(name: &'static str, mode: GatewayMode) -> Arc<Self> {
        Self::build(name, mode, false)
    }

    pub fn with_batch(name: &'static str, mode: GatewayMode) -> Arc<Self> {
        Self::build(name, mode, true)
    }

    fn build(name: &'static str, mode: GatewayMode, batch_supported: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            mode: Mutex::new(mode),
            delay: Mutex::new(None),
            batch_supported,
            query_reports: Mutex::new(Vec::new()),
            adds: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            amends: AtomicUsize::new(0),
            batches: AtomicUsize::new(0),
        })
    }

    pub fn set_mode(&self, mode: GatewayMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Hold every add for `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn set_query_reports(&self, reports: Vec<ExecutionReport>) {
        *self.query_reports.lock().unwrap() = reports;
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn outcome(&self) -> Result<()> {
        match &*self.mode.lock().unwrap() {
            GatewayMode::Accept | GatewayMode::AcceptThenReject(_) => Ok(()),
            GatewayMode::Down => Err(ExchangeError::NotConnected),
            GatewayMode::Reject(reason) => Err(ExchangeError::OrderRejected {
                reason: reason.clone(),
            }),
        }
    }
}

#[async_trait]
impl OrderGateway for MockGateway {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn add_order(&self, intent: &OrderIntent) -> Result<OrderAck> {
        let previous = self.adds.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if previous > 0
            && let GatewayMode::AcceptThenReject(reason) = &*self.mode.lock().unwrap()
        {
            return Err(ExchangeError::OrderRejected {
                reason: reason.clone(),
            });
        }
        self.outcome()?;
        Ok(OrderAck {
            order_id: format!("O-{}", intent.cl_ord_id),
            cl_ord_id: Some(intent.cl_ord_id.clone()),
            warnings: Vec::new(),
        })
    }

    async fn cancel_order(&self, target: &OrderRef) -> Result<CancelAck> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.outcome()?;
        let order_id = match target {
            OrderRef::Exchange(id) => Some(id.clone()),
            OrderRef::Client(_) => None,
        };
        Ok(CancelAck {
            order_id,
            cl_ord_id: None,
            count: Some(1),
        })
    }

    async fn amend_order(&self, _target: &OrderRef, _amend: &AmendRequest) -> Result<AmendAck> {
        self.amends.fetch_add(1, Ordering::SeqCst);
        self.outcome()?;
        Ok(AmendAck {
            amend_id: Some("A-1".to_string()),
            order_id: None,
            cl_ord_id: None,
        })
    }

    async fn batch_cancel(&self, targets: &[OrderRef]) -> Result<CancelAck> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        if !self.batch_supported {
            return Err(ExchangeError::Unsupported("batch_cancel"));
        }
        self.outcome()?;
        Ok(CancelAck {
            order_id: None,
            cl_ord_id: None,
            count: Some(targets.len() as u32),
        })
    }

    async fn query_orders(&self, _cl_ord_ids: &[String]) -> Result<Vec<ExecutionReport>> {
        Ok(self.query_reports.lock().unwrap().clone())
    }
}

/// Token source minting `tok-<n>` tokens valid for `lifetime`.
pub struct CountingTokens {
    lifetime: Duration,
    pub fetches: AtomicUsize,
}

impl CountingTokens {
    pub fn new(lifetime: Duration) -> Arc<Self> {
        Arc::new(Self {
            lifetime,
            fetches: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TokenSource for CountingTokens {
    async fn fetch_token(&self) -> Result<TokenGrant> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenGrant {
            token: format!("tok-{n}"),
            lifetime: self.lifetime,
        })
    }
}
