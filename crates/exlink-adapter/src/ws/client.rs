/*
[INPUT]:  WebSocket URL and session token
[OUTPUT]: Correlated method responses and push events via channels
[POS]:    WebSocket layer - private session handling
[UPDATE]: When adding new methods or changing connection logic
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use super::message::{Frame, MethodResponse, WebSocketMessage, WsEvent, parse_frame};
use crate::gateway::OrderGateway;
use crate::http::{ExchangeError, Result};
use crate::types::{AmendAck, AmendRequest, CancelAck, OrderAck, OrderIntent, OrderRef};

const DEFAULT_WS_URL: &str = "wss://ws-auth.kraken.com/v2";
const MESSAGE_SAMPLE_LIMIT: usize = 3;
const REQUEST_LOG_LIMIT: usize = 10;
const OTHER_LOG_LIMIT: usize = 3;
const PARSE_FAIL_LOG_LIMIT: usize = 3;
const RAW_LOG_MAX_BYTES: usize = 1024;
const DROP_LOG_LIMIT: usize = 5;

static MESSAGE_SAMPLE_COUNT: AtomicUsize = AtomicUsize::new(0);
static REQUEST_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);
static OTHER_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);
static PARSE_FAIL_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);
static DROP_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WsConfig {
    pub url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub event_capacity: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
            event_capacity: 1_024,
        }
    }
}

type PendingMap = StdMutex<HashMap<u64, oneshot::Sender<MethodResponse>>>;

struct Outbound {
    session: u64,
    tx: mpsc::Sender<WsMessage>,
}

struct Inner {
    config: WsConfig,
    event_tx: mpsc::Sender<WsEvent>,
    event_rx: StdMutex<Option<mpsc::Receiver<WsEvent>>>,
    outbound_tx: Mutex<Option<Outbound>>,
    pending: PendingMap,
    next_req_id: AtomicU64,
    next_session: AtomicU64,
    dropped_events: AtomicU64,
    token: StdMutex<Option<String>>,
}

/// Private WebSocket session: request/response correlation by `req_id` and a
/// single event stream for channel messages.
///
/// Cloning shares the session.
#[derive(Clone)]
pub struct PrivateWebSocket {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PrivateWebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateWebSocket")
            .field("url", &self.inner.config.url)
            .finish_non_exhaustive()
    }
}

impl PrivateWebSocket {
    pub fn new(config: WsConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                event_tx,
                event_rx: StdMutex::new(Some(event_rx)),
                outbound_tx: Mutex::new(None),
                pending: StdMutex::new(HashMap::new()),
                next_req_id: AtomicU64::new(1),
                next_session: AtomicU64::new(1),
                dropped_events: AtomicU64::new(0),
                token: StdMutex::new(None),
            }),
        }
    }

    /// Get the event receiver. Only the first caller gets it; it survives
    /// reconnects.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<WsEvent>> {
        self.inner
            .event_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Channel messages dropped because the event queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped_events.load(Ordering::Relaxed)
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.outbound_tx.lock().await.is_some()
    }

    /// Open the socket and start the read/write task.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.inner.outbound_tx.lock().await;
        if guard.is_some() {
            return Err(ExchangeError::WebSocket(
                "WebSocket already connected".to_string(),
            ));
        }

        let timeout = Duration::from_millis(self.inner.config.connect_timeout_ms);
        let (ws_stream, _response) =
            tokio::time::timeout(timeout, connect_async(self.inner.config.url.as_str()))
                .await
                .map_err(|_| ExchangeError::Timeout {
                    duration_ms: self.inner.config.connect_timeout_ms,
                })?
                .map_err(|err| ExchangeError::WebSocket(err.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsMessage>(100);
        let session = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        *guard = Some(Outbound {
            session,
            tx: outbound_tx,
        });
        drop(guard);
        info!(url = %self.inner.config.url, "private websocket connected");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    outbound = outbound_rx.recv() => {
                        match outbound {
                            Some(message) => {
                                if let Err(err) = write.send(message).await {
                                    break format!("send failed: {err}");
                                }
                            }
                            None => {
                                let _ = write.send(WsMessage::Close(None)).await;
                                break "closed locally".to_string();
                            }
                        }
                    }
                    incoming = read.next() => {
                        match incoming {
                            Some(Ok(WsMessage::Close(frame))) => {
                                let _ = write.send(WsMessage::Close(None)).await;
                                break match frame {
                                    Some(frame) => format!("closed by server: {}", frame.reason.as_str()),
                                    None => "closed by server".to_string(),
                                };
                            }
                            Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
                            Some(Ok(message)) => {
                                if let Some(message) = dispatch_frame(&inner.pending, message) {
                                    match inner.event_tx.try_send(WsEvent::Message(message)) {
                                        Ok(()) => {}
                                        Err(mpsc::error::TrySendError::Full(dropped)) => {
                                            inner.dropped_events.fetch_add(1, Ordering::Relaxed);
                                            log_event_dropped_once(&dropped);
                                        }
                                        Err(mpsc::error::TrySendError::Closed(_)) => {
                                            break "event receiver dropped".to_string();
                                        }
                                    }
                                }
                            }
                            Some(Err(err)) => break format!("read failed: {err}"),
                            None => break "stream ended".to_string(),
                        }
                    }
                }
            };

            {
                let mut outbound = inner.outbound_tx.lock().await;
                if outbound.as_ref().is_some_and(|current| current.session == session) {
                    *outbound = None;
                }
            }
            // Dropping the senders wakes waiters with a closed-channel error.
            inner
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clear();
            warn!(reason = %reason, "private websocket disconnected");
            let _ = inner.event_tx.send(WsEvent::Disconnected { reason }).await;
        });

        Ok(())
    }

    /// Close the session. Pending requests fail with `NotConnected`.
    pub async fn close(&self) {
        let sender = self.inner.outbound_tx.lock().await.take();
        drop(sender);
    }

    /// `authenticate{token}`; the token is then attached to later requests.
    pub async fn authenticate(&self, token: &str) -> Result<()> {
        self.set_token(Some(token.to_string()));
        match self.request("authenticate", json!({})).await {
            Ok(_) => Ok(()),
            Err(err) => {
                self.set_token(None);
                Err(err)
            }
        }
    }

    /// `subscribe{channel, snapshot}`.
    pub async fn subscribe(&self, channel: &str, snapshot: bool) -> Result<()> {
        self.request(
            "subscribe",
            json!({ "channel": channel, "snapshot": snapshot }),
        )
        .await
        .map(|_| ())
    }

    fn set_token(&self, token: Option<String>) {
        *self
            .inner
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token;
    }

    fn current_token(&self) -> Option<String> {
        self.inner
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Send `{method, params, req_id}` and wait for the matching response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let sender = {
            let guard = self.inner.outbound_tx.lock().await;
            guard
                .as_ref()
                .map(|outbound| outbound.tx.clone())
                .ok_or(ExchangeError::NotConnected)?
        };

        let mut params = match params {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        if let Some(token) = self.current_token() {
            params.insert("token".to_string(), Value::String(token));
        }

        let req_id = self.inner.next_req_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(req_id, tx);

        let message = json!({ "method": method, "params": params, "req_id": req_id });
        if sender
            .send(WsMessage::Text(message.to_string().into()))
            .await
            .is_err()
        {
            self.pending().remove(&req_id);
            return Err(ExchangeError::NotConnected);
        }
        log_request_sent(method, req_id);

        let timeout = Duration::from_millis(self.inner.config.request_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(ExchangeError::NotConnected),
            Err(_) => {
                self.pending().remove(&req_id);
                Err(ExchangeError::Timeout {
                    duration_ms: self.inner.config.request_timeout_ms,
                })
            }
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<MethodResponse>>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Route a frame: responses complete their waiter, channel messages are
/// returned for the event stream.
fn dispatch_frame(pending: &PendingMap, message: WsMessage) -> Option<WebSocketMessage> {
    let text: String = match message {
        WsMessage::Text(text) => text.to_string(),
        WsMessage::Binary(bytes) => String::from_utf8(bytes.to_vec()).ok()?,
        _ => return None,
    };

    match parse_frame(&text) {
        Ok(Frame::Response(response)) => {
            let waiter = response.req_id.and_then(|req_id| {
                pending
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&req_id)
            });
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(response);
                }
                None => debug!(
                    method = %response.method,
                    req_id = ?response.req_id,
                    "uncorrelated method response"
                ),
            }
            None
        }
        Ok(Frame::Channel(parsed)) => {
            if matches!(parsed, WebSocketMessage::Other) {
                log_other_message_once(&text);
                return None;
            }
            log_message_sample_once(&parsed);
            Some(parsed)
        }
        Err(err) => {
            log_parse_fail_once(&err, &text);
            None
        }
    }
}

#[async_trait]
impl OrderGateway for PrivateWebSocket {
    fn name(&self) -> &'static str {
        "ws"
    }

    async fn add_order(&self, intent: &OrderIntent) -> Result<OrderAck> {
        let result = self.request("add_order", intent.to_params()).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn cancel_order(&self, target: &OrderRef) -> Result<CancelAck> {
        let result = self
            .request("cancel_order", Value::Object(target.to_params()))
            .await?;
        Ok(serde_json::from_value(result).unwrap_or_default())
    }

    async fn amend_order(&self, target: &OrderRef, amend: &AmendRequest) -> Result<AmendAck> {
        let result = self.request("amend_order", amend.to_params(target)).await?;
        Ok(serde_json::from_value(result).unwrap_or_default())
    }

    async fn batch_cancel(&self, targets: &[OrderRef]) -> Result<CancelAck> {
        let mut order_ids = Vec::new();
        let mut cl_ord_ids = Vec::new();
        for target in targets {
            match target {
                OrderRef::Exchange(id) => order_ids.push(id.clone()),
                OrderRef::Client(id) => cl_ord_ids.push(id.clone()),
            }
        }
        let result = self
            .request(
                "batch_cancel",
                json!({ "orders": order_ids, "cl_ord_id": cl_ord_ids }),
            )
            .await?;
        Ok(serde_json::from_value(result).unwrap_or_default())
    }
}

fn log_request_sent(method: &str, req_id: u64) {
    let count = REQUEST_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < REQUEST_LOG_LIMIT {
        info!(
            sample_index = count + 1,
            sample_limit = REQUEST_LOG_LIMIT,
            method,
            req_id,
            "ws request sent"
        );
    } else {
        debug!(method, req_id, "ws request sent");
    }
}

fn log_event_dropped_once(event: &WsEvent) {
    let count = DROP_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < DROP_LOG_LIMIT {
        let channel = match event {
            WsEvent::Message(message) => message.channel(),
            WsEvent::Disconnected { .. } => "disconnected",
        };
        warn!(
            sample_index = count + 1,
            sample_limit = DROP_LOG_LIMIT,
            channel,
            "ws event queue full, dropping message"
        );
    }
}

fn log_message_sample_once(message: &WebSocketMessage) {
    let count = MESSAGE_SAMPLE_COUNT.fetch_add(1, Ordering::Relaxed);
    if count >= MESSAGE_SAMPLE_LIMIT {
        return;
    }
    info!(
        sample_index = count + 1,
        sample_limit = MESSAGE_SAMPLE_LIMIT,
        channel = message.channel(),
        "ws message sample"
    );
}

fn log_other_message_once(raw: &str) {
    let count = OTHER_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < OTHER_LOG_LIMIT {
        info!(
            sample_index = count + 1,
            sample_limit = OTHER_LOG_LIMIT,
            bytes = raw.len(),
            "ws message channel unrecognized"
        );
        let preview = truncate_for_log(raw, RAW_LOG_MAX_BYTES);
        debug!(
            sample_index = count + 1,
            sample_limit = OTHER_LOG_LIMIT,
            bytes = raw.len(),
            message = %preview,
            "ws message channel unrecognized"
        );
    }
}

fn log_parse_fail_once(err: &serde_json::Error, raw: &str) {
    let count = PARSE_FAIL_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < PARSE_FAIL_LOG_LIMIT {
        info!(
            sample_index = count + 1,
            sample_limit = PARSE_FAIL_LOG_LIMIT,
            error = %err,
            bytes = raw.len(),
            "ws message parse failed"
        );
        let preview = truncate_for_log(raw, RAW_LOG_MAX_BYTES);
        debug!(
            sample_index = count + 1,
            sample_limit = PARSE_FAIL_LOG_LIMIT,
            error = %err,
            bytes = raw.len(),
            message = %preview,
            "ws message parse failed"
        );
    }
}

fn truncate_for_log(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut cut = max_len;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = String::with_capacity(cut + 3);
    out.push_str(&value[..cut]);
    out.push_str("...");
    out
}
