//! Reconciliation after a reconnect: venue-side orders merge by exchange
//! id or client order id, and in-memory trailing trigger state survives.

mod common;

use common::{MockExchangeClient, wait_until};
use helmsman::application::order_manager::{OrderManagerActor, OrderManagerMsg};
use helmsman::application::portfolio::PortfolioActor;
use helmsman::domain::errors::CoreError;
use helmsman::domain::order::{OrderIntent, OrderSide, OrderStatus, OrderType};
use helmsman::domain::ports::ExchangeOrder;
use helmsman::infrastructure::persistence::Database;
use helmsman::infrastructure::persistence::repositories::{
    SqliteOrderRepository, SqliteTradeRepository,
};
use helmsman::runtime::{ASK_TIMEOUT, Addr, SpawnOpts, spawn};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

async fn fixture() -> (Arc<MockExchangeClient>, Addr<OrderManagerMsg>) {
    let db = Database::open_in_memory().await.unwrap();
    let client = Arc::new(MockExchangeClient::with_cash(dec!(100000)));
    let (portfolio, h) = spawn(
        "portfolio",
        PortfolioActor::new("bybit".to_string(), client.clone(), None)
            .with_sync_interval(Duration::from_secs(3600)),
        SpawnOpts::default(),
    );
    std::mem::forget(h);
    let (manager, h) = spawn(
        "order-manager",
        OrderManagerActor::new(
            "bybit".to_string(),
            client.clone(),
            Arc::new(SqliteOrderRepository::new(db.clone())),
            Arc::new(SqliteTradeRepository::new(db)),
            portfolio,
        ),
        SpawnOpts::default(),
    );
    std::mem::forget(h);
    (client, manager)
}

async fn price(manager: &Addr<OrderManagerMsg>, value: Decimal) {
    manager
        .tell(OrderManagerMsg::PriceUpdate {
            symbol: "BTCUSDT".to_string(),
            price: value,
        })
        .await;
}

#[tokio::test]
async fn trailing_state_survives_reconcile_and_resumes() {
    let (client, manager) = fixture().await;

    // Arm a trailing stop and ratchet its mark to 112.
    price(&manager, dec!(100)).await;
    let mut intent = OrderIntent::market("BTCUSDT", OrderSide::Sell, dec!(1));
    intent.order_type = OrderType::TrailingStop;
    intent.trail_percent = Some(dec!(2));
    manager
        .ask(
            |reply| OrderManagerMsg::Submit { intent, reply },
            ASK_TIMEOUT,
        )
        .await
        .unwrap()
        .unwrap();
    price(&manager, dec!(110)).await;
    price(&manager, dec!(112)).await;

    // Session reconnects; the venue reports an unrelated open limit order.
    client.open_orders.lock().unwrap().push(ExchangeOrder {
        exchange_id: "venue-77".to_string(),
        client_order_id: None,
        symbol: "ETHUSDT".to_string(),
        side: OrderSide::Buy,
        order_type: OrderType::Limit,
        quantity: dec!(3),
        filled_quantity: Decimal::ZERO,
        price: Some(dec!(2000)),
        status: OrderStatus::Open,
    });
    manager.tell(OrderManagerMsg::Reconcile).await;

    let open_check = |orders: &[helmsman::domain::order::Order]| {
        orders
            .iter()
            .find(|o| o.order_type == OrderType::TrailingStop)
            .map(|o| (o.high_water_mark, o.is_triggered))
    };
    let manager_clone = manager.clone();
    let adopted = async move {
        loop {
            let open = manager_clone
                .ask(|reply| OrderManagerMsg::OpenOrders { reply }, ASK_TIMEOUT)
                .await
                .unwrap();
            if open.iter().any(|o| o.exchange_id.as_deref() == Some("venue-77")) {
                return open;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    let open = tokio::time::timeout(Duration::from_secs(2), adopted)
        .await
        .expect("venue order adopted");

    // The trailing mark is untouched by reconciliation.
    assert_eq!(open_check(&open), Some((Some(dec!(112)), false)));

    // Trigger evaluation resumes on the next update: 108 <= 109.76.
    price(&manager, dec!(108)).await;
    wait_until(
        || {
            client
                .placed
                .lock()
                .unwrap()
                .iter()
                .any(|r| r.symbol == "BTCUSDT" && r.side == OrderSide::Sell)
        },
        "trailing child submitted after reconcile",
    )
    .await;
}

#[tokio::test]
async fn lost_ack_is_recovered_by_client_order_id() {
    let (client, manager) = fixture().await;

    // Both the first attempt and the retry fail transiently: no exchange
    // id, order stays pending.
    client.queue_place_response(Err(CoreError::Network("reset".to_string())));
    client.queue_place_response(Err(CoreError::Network("reset".to_string())));
    let order = manager
        .ask(
            |reply| OrderManagerMsg::Submit {
                intent: {
                    let mut i = OrderIntent::market("BTCUSDT", OrderSide::Buy, dec!(1));
                    i.order_type = OrderType::Limit;
                    i.limit_price = Some(dec!(95));
                    i
                },
                reply,
            },
            ASK_TIMEOUT,
        )
        .await
        .unwrap()
        .unwrap();

    wait_until(|| client.placed_count() == 2, "place retried once").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Still exactly the one retry.
    assert_eq!(client.placed_count(), 2);

    // The venue actually accepted it; reconcile finds it by the stamped
    // client order id.
    client.open_orders.lock().unwrap().push(ExchangeOrder {
        exchange_id: "venue-9".to_string(),
        client_order_id: Some(format!("bybit-{}", order.local_id)),
        symbol: "BTCUSDT".to_string(),
        side: OrderSide::Buy,
        order_type: OrderType::Limit,
        quantity: dec!(1),
        filled_quantity: Decimal::ZERO,
        price: Some(dec!(95)),
        status: OrderStatus::Open,
    });
    manager.tell(OrderManagerMsg::Reconcile).await;

    let manager_clone = manager.clone();
    let local_id = order.local_id;
    let reconciled = async move {
        loop {
            let open = manager_clone
                .ask(|reply| OrderManagerMsg::OpenOrders { reply }, ASK_TIMEOUT)
                .await
                .unwrap();
            if let Some(o) = open.iter().find(|o| o.local_id == local_id)
                && o.exchange_id.as_deref() == Some("venue-9")
            {
                assert_eq!(o.status, OrderStatus::Open);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), reconciled)
        .await
        .expect("order reconciled by client order id");
}
