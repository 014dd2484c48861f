mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use exlink_adapter::{
    CircuitState, MessageKind, SourceTag, TokenConfig, TokenLifecycleManager, WebSocketMessage,
    WsEvent,
};
use exlink_core::router::{ConnectivityRouter, HealthStatus, RouterConfig, SourceKind};

use common::{CountingTokens, MockBalances, dec, entry, offline_channel, streaming_channel};

fn push_only_config() -> RouterConfig {
    RouterConfig {
        push_ratio: 1.0,
        ..RouterConfig::default()
    }
}

#[tokio::test]
async fn serves_pull_while_push_is_down() {
    let pull = MockBalances::up(vec![entry("USD", "100", 0, SourceTag::Pull)]);
    let router = ConnectivityRouter::new(push_only_config(), offline_channel(), pull.clone());

    for _ in 0..3 {
        let served = router.get_balance("usd").await.unwrap();
        assert_eq!(served.source, SourceTag::Pull);
        assert_eq!(served.total, dec("100"));
    }

    assert_eq!(router.tracker(SourceKind::Push).status(), HealthStatus::Failed);
    assert_eq!(router.tracker(SourceKind::Pull).status(), HealthStatus::Healthy);
    assert_eq!(pull.calls(), 3);
}

#[tokio::test]
async fn falls_back_to_cache_within_ttl() {
    let pull = MockBalances::up(vec![entry("USD", "100", 10, SourceTag::Pull)]);
    let router = ConnectivityRouter::new(RouterConfig::default(), offline_channel(), pull.clone());

    assert_eq!(router.get_balance("USD").await.unwrap().source, SourceTag::Pull);

    pull.set_down();
    let cached = router.get_balance("USD").await.unwrap();
    assert_eq!(cached.source, SourceTag::Cache);
    assert_eq!(cached.total, dec("100"));
}

#[tokio::test]
async fn cache_past_ttl_is_unavailable() {
    let pull = MockBalances::up(vec![entry("USD", "100", 40, SourceTag::Pull)]);
    let router = ConnectivityRouter::new(RouterConfig::default(), offline_channel(), pull.clone());

    router.get_balance("USD").await.unwrap();
    pull.set_down();

    let err = router.get_balance("USD").await.unwrap_err();
    assert!(err.is_unavailable());
    assert_eq!(router.health_report().await.served.unavailable, 1);
}

#[tokio::test]
async fn failed_pull_is_not_called_again() {
    let pull = MockBalances::down();
    let router = ConnectivityRouter::new(RouterConfig::default(), offline_channel(), pull.clone());

    for _ in 0..5 {
        assert!(router.get_balance("USD").await.is_err());
    }

    assert_eq!(pull.calls(), 3);
    assert_eq!(router.tracker(SourceKind::Pull).status(), HealthStatus::Failed);
    assert_eq!(router.health_report().await.pull_breaker.state, CircuitState::Open);
}

#[tokio::test]
async fn push_disagreeing_with_pull_is_served_and_counted() {
    let channel = streaming_channel(json!([{ "asset": "USD", "balance": "100" }])).await;
    let pull = MockBalances::up(vec![entry("USD", "100.02", 0, SourceTag::Pull)]);
    let router = ConnectivityRouter::new(push_only_config(), channel, pull);

    assert_eq!(router.refresh_from_pull().await.unwrap(), 1);

    let served = router.get_balance("USD").await.unwrap();
    assert_eq!(served.source, SourceTag::Push);
    assert_eq!(served.total, dec("100"));

    let health = router.health_report().await;
    assert_eq!(health.validation.cross_source_inconsistencies, 1);
    assert_eq!(health.served.push, 1);
}

#[tokio::test]
async fn force_fresh_prefers_pull() {
    let channel = streaming_channel(json!([{ "asset": "USD", "balance": "100" }])).await;
    let pull = MockBalances::up(vec![entry("USD", "101", 0, SourceTag::Pull)]);
    let router = ConnectivityRouter::new(push_only_config(), channel, pull);

    let served = router.get_balance_with("USD", true).await.unwrap();
    assert_eq!(served.source, SourceTag::Pull);
    assert_eq!(served.total, dec("101"));
}

#[tokio::test]
async fn all_balances_fill_missing_assets_from_cache() {
    let channel = streaming_channel(json!([{ "asset": "USD", "balance": "100" }])).await;
    let pull = MockBalances::up(vec![
        entry("USD", "99", 5, SourceTag::Pull),
        entry("BTC", "0.5", 5, SourceTag::Pull),
    ]);
    let router = ConnectivityRouter::new(push_only_config(), channel, pull);
    router.refresh_from_pull().await.unwrap();

    let all = router.get_all_balances().await.unwrap();
    let summary: Vec<(&str, SourceTag)> = all
        .iter()
        .map(|entry| (entry.asset.as_str(), entry.source))
        .collect();
    assert_eq!(summary, vec![("BTC", SourceTag::Cache), ("USD", SourceTag::Push)]);
}

#[tokio::test]
async fn all_balances_replace_aged_push_entries_from_pull() {
    let channel = streaming_channel(json!([{ "asset": "ETH", "balance": "1" }])).await;
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    channel
        .ingest(WsEvent::Message(WebSocketMessage::Balances {
            kind: MessageKind::Update,
            data: json!([{ "asset": "USD", "balance": "100" }]),
        }))
        .await;

    let pull = MockBalances::up(vec![
        entry("ETH", "2", 0, SourceTag::Pull),
        entry("USD", "99", 0, SourceTag::Pull),
    ]);
    let config = RouterConfig {
        max_age_secs: 1,
        ..push_only_config()
    };
    let router = ConnectivityRouter::new(config, channel, pull.clone());

    let all = router.get_all_balances().await.unwrap();
    let summary: Vec<(&str, SourceTag, String)> = all
        .iter()
        .map(|entry| (entry.asset.as_str(), entry.source, entry.total.to_string()))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("ETH", SourceTag::Pull, "2".to_string()),
            ("USD", SourceTag::Push, "100".to_string()),
        ]
    );
    assert_eq!(pull.calls(), 1);
}

#[tokio::test]
async fn spendable_quote_sums_aliases_minus_fee_buffer() {
    let channel = streaming_channel(json!({ "USD": "60", "ZUSD": "40" })).await;
    let router = ConnectivityRouter::new(push_only_config(), channel, MockBalances::down());

    let quote = router.get_quote_total().await.unwrap();
    assert_eq!(quote.asset, "USD");
    assert_eq!(quote.total, dec("100"));

    assert_eq!(router.get_spendable_quote().await.unwrap(), dec("99.74"));
}

#[tokio::test]
async fn reconnect_attempts_back_off() {
    let tokens_source = CountingTokens::new(Duration::from_secs(900));
    let tokens = TokenLifecycleManager::new(tokens_source.clone(), TokenConfig::default());
    let pull = MockBalances::up(vec![entry("USD", "1", 0, SourceTag::Pull)]);
    let router = Arc::new(ConnectivityRouter::new(
        RouterConfig::default(),
        offline_channel(),
        pull,
    ));

    router.health_tick(&tokens).await;
    router.health_tick(&tokens).await;

    assert_eq!(
        tokens_source.fetches.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    assert_eq!(router.tracker(SourceKind::Push).status(), HealthStatus::Degraded);
    assert!(!router.is_push_disabled());
}
