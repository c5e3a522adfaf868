//! Session lifecycle: child tree spawn, strategy auto-start, gateway
//! surface, risk-parameter persistence and orderly shutdown.

mod common;

use common::MockExchangeClient;
use helmsman::application::session::{SessionActor, SessionDeps, SessionMsg};
use helmsman::config::{RiskConfig, StrategiesConfig, VenueConfig};
use helmsman::infrastructure::persistence::Database;
use helmsman::infrastructure::persistence::repositories::{
    SqliteOrderRepository, SqliteSettingsRepository, SqliteSnapshotRepository,
    SqliteTradeRepository,
};
use helmsman::runtime::{ASK_TIMEOUT, Addr, ChildHandle, SpawnOpts, spawn};
use std::sync::Arc;
use std::time::Duration;

const IDLE_SCRIPT: &str = r#"
    fn settings() {
        #{ interval: "1m" }
    }

    fn on_kline(kline) {
    }
"#;

async fn session_fixture() -> (Addr<SessionMsg>, ChildHandle) {
    let db = Database::open_in_memory().await.unwrap();
    let client = Arc::new(MockExchangeClient::with_cash(rust_decimal_macros::dec!(50000)));
    let deps = SessionDeps {
        client,
        orders_repo: Arc::new(SqliteOrderRepository::new(db.clone())),
        trades_repo: Arc::new(SqliteTradeRepository::new(db.clone())),
        settings_repo: Arc::new(SqliteSettingsRepository::new(db.clone())),
        snapshots_repo: Some(Arc::new(SqliteSnapshotRepository::new(db))),
        risk_config: RiskConfig::default(),
        scripts: vec![("idle".to_string(), IDLE_SCRIPT.to_string())],
        ws_url: None,
    };
    let venue_config = VenueConfig {
        enabled: true,
        pairs: vec!["BTCUSDT".to_string()],
        api_key: "k".to_string(),
        api_secret: "s".to_string(),
        testnet: true,
        price_sanity_adjustment: false,
        rest_rate_per_sec: 100,
    };
    spawn(
        "session/bybit",
        SessionActor::new(
            "bybit".to_string(),
            venue_config,
            StrategiesConfig::default(),
            deps,
        ),
        SpawnOpts::default(),
    )
}

#[tokio::test]
async fn session_starts_strategies_and_reports_status() {
    let (session, handle) = session_fixture().await;

    let status = session
        .ask(|reply| SessionMsg::Status { reply }, ASK_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(status.venue, "bybit");
    assert_eq!(status.strategies, 1);
    assert_eq!(status.kline_subscriptions, 1);

    let strategies = session
        .ask(|reply| SessionMsg::ListStrategies { reply }, ASK_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(strategies.len(), 1);
    assert_eq!(strategies[0].symbol, "BTCUSDT");
    assert_eq!(strategies[0].script, "idle");
    assert!(strategies[0].active);

    // Stop is a deactivation, not a teardown.
    session
        .ask(
            |reply| SessionMsg::StopStrategy {
                id: strategies[0].id.clone(),
                reply,
            },
            ASK_TIMEOUT,
        )
        .await
        .unwrap()
        .unwrap();
    let strategies = session
        .ask(|reply| SessionMsg::ListStrategies { reply }, ASK_TIMEOUT)
        .await
        .unwrap();
    assert!(!strategies[0].active);

    handle.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn duplicate_subscriptions_are_one_logical_subscription() {
    let (session, handle) = session_fixture().await;

    for _ in 0..3 {
        session
            .tell(SessionMsg::SubscribeKlines {
                symbols: vec!["ETHUSDT".to_string()],
                interval: "1m".parse().unwrap(),
            })
            .await;
    }
    let status = session
        .ask(|reply| SessionMsg::Status { reply }, ASK_TIMEOUT)
        .await
        .unwrap();
    // One from the auto-started strategy, one for ETHUSDT.
    assert_eq!(status.kline_subscriptions, 2);

    handle.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn risk_parameters_persist_through_settings() {
    let (session, handle) = session_fixture().await;

    let before = session
        .ask(
            |reply| SessionMsg::GetRiskParam {
                key: "max_drawdown".to_string(),
                reply,
            },
            ASK_TIMEOUT,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before, None);

    session
        .ask(
            |reply| SessionMsg::SetRiskParam {
                key: "max_drawdown".to_string(),
                value: "0.25".to_string(),
                reply,
            },
            ASK_TIMEOUT,
        )
        .await
        .unwrap()
        .unwrap();

    let after = session
        .ask(
            |reply| SessionMsg::GetRiskParam {
                key: "max_drawdown".to_string(),
                reply,
            },
            ASK_TIMEOUT,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.as_deref(), Some("0.25"));

    handle.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn portfolio_summary_is_exposed_to_the_gateway() {
    let (session, handle) = session_fixture().await;

    // Give the portfolio's initial sync a moment to adopt mock balances.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let summary = session
        .ask(|reply| SessionMsg::PortfolioSummary { reply }, ASK_TIMEOUT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.exchange, "bybit");
    assert_eq!(summary.available_cash, rust_decimal_macros::dec!(50000));

    handle.stop(Duration::from_secs(5)).await;
}
