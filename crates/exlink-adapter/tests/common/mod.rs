/*
[INPUT]:  Test configuration and mock server requirements
[OUTPUT]: Shared test utilities, fixtures, and mock helpers
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for exlink-adapter tests

#![allow(dead_code)]

use std::sync::Arc;

use exlink_adapter::{
    ClientConfig, Credentials, ExchangeClient, MockRequestSigner, NonceAuthority,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use wiremock::MockServer;

pub const API_KEY: &str = "test-api-key";
pub const KEY_ID: &str = "test-key";

/// Setup a mock HTTP server for testing
pub async fn setup_mock_server() -> MockServer {
    MockServer::start().await
}

pub fn test_client(server: &MockServer) -> (ExchangeClient, Arc<NonceAuthority>) {
    let nonces = Arc::new(NonceAuthority::in_memory());
    let config = ClientConfig {
        rest_url: server.uri(),
        timeout_ms: 2_000,
        connect_timeout_ms: 2_000,
    };
    let client = ExchangeClient::new(
        config,
        Credentials {
            api_key: API_KEY.to_string(),
            key_id: KEY_ID.to_string(),
        },
        Arc::new(MockRequestSigner::new("mock-signature")),
        nonces.clone(),
    )
    .expect("client builds");
    (client, nonces)
}

pub fn ok_envelope(result: Value) -> Value {
    json!({ "error": [], "result": result })
}

pub fn error_envelope(message: &str) -> Value {
    json!({ "error": [message] })
}

/// One-connection WebSocket server that answers every request with success
/// and pushes a balance snapshot after a `balances` subscription.
///
/// Every request received is forwarded on the returned channel. Sending
/// `"close"` as a method closes the server side.
pub async fn spawn_ws_server() -> (String, mpsc::UnboundedReceiver<Value>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = accept_async(stream).await else {
            return;
        };

        while let Some(Ok(message)) = ws.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let request: Value = serde_json::from_str(text.as_str()).expect("json request");
            let _ = seen_tx.send(request.clone());

            let method = request["method"].as_str().unwrap_or_default().to_string();
            if method == "close" {
                let _ = ws.close(None).await;
                break;
            }

            let result = match method.as_str() {
                "add_order" => json!({
                    "order_id": "OX-1",
                    "cl_ord_id": request["params"]["cl_ord_id"].clone(),
                }),
                "cancel_order" | "batch_cancel" => json!({ "count": 1 }),
                _ => json!({}),
            };
            let reply = json!({
                "method": method,
                "req_id": request["req_id"].clone(),
                "success": true,
                "result": result,
            });
            if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                break;
            }

            if method == "subscribe" && request["params"]["channel"] == "balances" {
                let snapshot = json!({
                    "channel": "balances",
                    "type": "snapshot",
                    "data": [
                        { "asset": "USD", "balance": "100.02", "hold_trade": "0" },
                        { "asset": "BTC", "balance": 0.5 }
                    ]
                });
                let _ = ws.send(Message::Text(snapshot.to_string().into())).await;
            }
        }
    });

    (format!("ws://{addr}"), seen_rx, handle)
}
