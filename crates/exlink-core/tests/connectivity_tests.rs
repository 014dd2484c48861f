mod common;

use std::sync::Arc;

use serde_json::{Value, json};
use tokio_test::assert_ok;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use exlink_adapter::{MockRequestSigner, SourceTag};
use exlink_core::{ConnectivityCore, CoreConfig, OrderStatus};

use common::{dec, limit_intent};

fn ok_envelope(result: Value) -> Value {
    json!({ "error": [], "result": result })
}

async fn mock_exchange() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/0/private/GetWebSocketsToken"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(ok_envelope(json!({ "token": "ws-token", "expires": 900 }))),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/0/private/BalanceEx"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_envelope(json!({
            "ZUSD": { "balance": "100.5", "hold_trade": "0.5" },
            "USDT": { "balance": "50", "hold_trade": "0" },
            "XXBT": { "balance": "0.25", "hold_trade": "0" }
        }))))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/0/private/AddOrder"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_envelope(json!({
            "order_id": "OREST-1",
            "cl_ord_id": "c1"
        }))))
        .mount(&server)
        .await;
    server
}

fn config_for(server: &MockServer) -> CoreConfig {
    let mut config = CoreConfig::default();
    config.exchange.api_key = "test-api-key".to_string();
    config.exchange.rest.rest_url = server.uri();
    config.exchange.ws.url = "ws://127.0.0.1:9".to_string();
    config.exchange.ws.connect_timeout_ms = 500;
    config
}

fn build(server: &MockServer) -> ConnectivityCore {
    assert_ok!(ConnectivityCore::new(
        config_for(server),
        Arc::new(MockRequestSigner::new("sig")),
    ))
}

#[tokio::test]
async fn balances_come_from_rest_without_a_stream() {
    let server = mock_exchange().await;
    let core = build(&server);

    let quote = core.router().get_quote_total().await.unwrap();
    assert_eq!(quote.asset, "USD");
    assert_eq!(quote.total, dec("150.5"));
    assert_eq!(quote.available, dec("150"));

    let usdt = core.router().get_balance("USDT").await.unwrap();
    assert_eq!(usdt.source, SourceTag::Pull);
}

#[tokio::test]
async fn orders_fall_back_to_rest_when_ws_is_down() {
    let server = mock_exchange().await;
    let core = build(&server);

    let state = core.orders().submit(limit_intent("c1")).await.unwrap();
    assert_eq!(state.status, OrderStatus::Open);
    assert_eq!(state.order_id.as_deref(), Some("OREST-1"));
    assert_eq!(state.transport, Some("rest"));
}

#[tokio::test]
async fn start_then_shutdown() {
    let server = mock_exchange().await;
    let core = build(&server);

    core.start();
    core.start();

    let health = core.health_report().await;
    assert_eq!(health.orders.tracked, 0);
    assert!(serde_json::to_value(&health).unwrap().get("router").is_some());

    assert_ok!(core.shutdown_and_wait().await);
    assert!(core.shutdown_token().is_cancelled());
}
