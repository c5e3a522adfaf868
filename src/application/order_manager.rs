//! Order lifecycle manager for one exchange.
//!
//! Native orders (market, limit) are submitted straight to the venue on an
//! I/O task; price-triggered orders (stop-market, stop-limit, trailing
//! stop) live here as state machines and submit a native child order when
//! they fire. The in-memory map is the authoritative live view; every
//! change shadows into the order repository, which also restores trailing
//! trigger state (`high_water_mark`, `is_triggered`) across restarts.
//!
//! REST I/O never runs inside the mailbox: placement, cancellation and
//! reconciliation all happen on spawned tasks that report back by message.

use crate::application::portfolio::PortfolioMsg;
use crate::application::triggers::{self, TriggerDecision};
use crate::domain::errors::CoreError;
use crate::domain::order::{Order, OrderIntent, OrderStatus, OrderType};
use crate::domain::portfolio::Trade;
use crate::domain::ports::{ExchangeAck, ExchangeClient, ExchangeOrder, OrderRequest, OrderUpdate};
use crate::domain::repositories::{OrderRepository, TradeRepository};
use crate::runtime::{Actor, ActorContext, Addr};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Delay before the single retry of a place that failed transiently.
const PLACE_RETRY_DELAY: Duration = Duration::from_secs(2);

pub enum OrderManagerMsg {
    /// Accept an intent that already passed the risk gate.
    Submit {
        intent: OrderIntent,
        reply: oneshot::Sender<Result<Order, CoreError>>,
    },
    Cancel {
        local_id: u64,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    PriceUpdate {
        symbol: String,
        price: Decimal,
    },
    /// Fill or status change reported by the venue.
    ExchangeUpdate(OrderUpdate),
    /// Completion of a place I/O task.
    PlaceOutcome {
        local_id: u64,
        attempt: u32,
        result: Result<ExchangeAck, CoreError>,
    },
    /// Session reconnected; merge venue-side open orders.
    Reconcile,
    ReconcileOutcome {
        result: Result<Vec<ExchangeOrder>, CoreError>,
    },
    OpenOrders {
        reply: oneshot::Sender<Vec<Order>>,
    },
    RecentOrders {
        symbol: Option<String>,
        limit: u32,
        reply: oneshot::Sender<Result<Vec<Order>, CoreError>>,
    },
}

pub struct OrderManagerActor {
    exchange: String,
    client: Arc<dyn ExchangeClient>,
    orders_repo: Arc<dyn OrderRepository>,
    trades_repo: Arc<dyn TradeRepository>,
    portfolio: Addr<PortfolioMsg>,
    /// Live non-terminal orders, keyed by local id. BTreeMap iteration
    /// order is submission order, which settles same-tick trigger ties.
    orders: BTreeMap<u64, Order>,
    next_local_id: u64,
    last_price: HashMap<String, Decimal>,
}

impl OrderManagerActor {
    pub fn new(
        exchange: String,
        client: Arc<dyn ExchangeClient>,
        orders_repo: Arc<dyn OrderRepository>,
        trades_repo: Arc<dyn TradeRepository>,
        portfolio: Addr<PortfolioMsg>,
    ) -> Self {
        OrderManagerActor {
            exchange,
            client,
            orders_repo,
            trades_repo,
            portfolio,
            orders: BTreeMap::new(),
            next_local_id: 1,
            last_price: HashMap::new(),
        }
    }

    async fn persist(&self, order: &Order) -> Result<(), CoreError> {
        self.orders_repo.upsert(order).await
    }

    fn build_request(&self, order: &Order) -> OrderRequest {
        OrderRequest {
            symbol: order.symbol.clone(),
            side: order.side,
            // A fired stop-limit goes out as a limit, everything else as
            // its native type (trailing stops fire as markets).
            order_type: match order.order_type {
                OrderType::Limit | OrderType::StopLimit => OrderType::Limit,
                _ => OrderType::Market,
            },
            quantity: order.quantity,
            price: match order.order_type {
                OrderType::Limit | OrderType::StopLimit => order.limit_price,
                _ => None,
            },
            time_in_force: order.time_in_force,
            client_order_id: format!("{}-{}", self.exchange, order.local_id),
        }
    }

    fn spawn_place(&self, ctx: &ActorContext<OrderManagerMsg>, order: &Order, attempt: u32) {
        let client = self.client.clone();
        let addr = ctx.addr();
        let local_id = order.local_id;
        let request = self.build_request(order);
        tokio::spawn(async move {
            if attempt > 1 {
                tokio::time::sleep(PLACE_RETRY_DELAY).await;
            }
            let result = client.place_order(&request).await;
            addr.tell(OrderManagerMsg::PlaceOutcome {
                local_id,
                attempt,
                result,
            })
            .await;
        });
    }

    /// Submit several fired orders on one I/O task so same-tick triggers
    /// reach the venue in submission order.
    fn spawn_place_batch(&self, ctx: &ActorContext<OrderManagerMsg>, batch: Vec<(u64, OrderRequest)>) {
        let client = self.client.clone();
        let addr = ctx.addr();
        tokio::spawn(async move {
            for (local_id, request) in batch {
                let result = client.place_order(&request).await;
                addr.tell(OrderManagerMsg::PlaceOutcome {
                    local_id,
                    attempt: 1,
                    result,
                })
                .await;
            }
        });
    }

    async fn handle_submit(
        &mut self,
        ctx: &ActorContext<OrderManagerMsg>,
        intent: OrderIntent,
    ) -> Result<Order, CoreError> {
        let local_id = self.next_local_id;
        let mut order = Order::from_intent(local_id, &self.exchange, &intent, Utc::now());
        order.validate()?;
        self.next_local_id += 1;

        if order.is_price_triggered_type() {
            // Armed locally; a trailing stop activates at the last known
            // price, or at the first update if none has been seen yet.
            if order.order_type == OrderType::TrailingStop {
                order.high_water_mark = self.last_price.get(&order.symbol).copied();
            }
            order.transition(OrderStatus::Open, Utc::now())?;
            self.persist(&order).await?;
            info!(
                component = "order-manager",
                exchange = %self.exchange,
                symbol = %order.symbol,
                local_id,
                order_type = %order.order_type,
                "trigger order armed"
            );
        } else {
            self.persist(&order).await?;
            self.spawn_place(ctx, &order, 1);
        }
        self.orders.insert(local_id, order.clone());
        Ok(order)
    }

    async fn handle_price_update(
        &mut self,
        ctx: &ActorContext<OrderManagerMsg>,
        symbol: &str,
        price: Decimal,
    ) -> Result<(), CoreError> {
        self.last_price.insert(symbol.to_string(), price);

        let mut fired: Vec<u64> = Vec::new();
        for order in self.orders.values_mut() {
            if order.symbol != symbol {
                continue;
            }
            if triggers::evaluate(order, price) == TriggerDecision::Fire {
                // At-most-once: the flag is set in the same serialized
                // handler that observed the trigger.
                order.is_triggered = true;
                order.updated_at = Utc::now();
                fired.push(order.local_id);
            }
        }

        let mut batch = Vec::with_capacity(fired.len());
        for local_id in &fired {
            let order = self.orders.get(local_id).cloned().expect("fired order exists");
            info!(
                component = "order-manager",
                exchange = %self.exchange,
                symbol = %order.symbol,
                local_id = order.local_id,
                trigger_price = %order.trigger_price.unwrap_or_default(),
                price = %price,
                "trigger fired, submitting child order"
            );
            self.persist(&order).await?;
            batch.push((order.local_id, self.build_request(&order)));
        }
        if !batch.is_empty() {
            self.spawn_place_batch(ctx, batch);
        }

        // Trailing marks move on most updates; shadow them so a restart
        // resumes from the latest state.
        for order in self.orders.values() {
            if order.order_type == OrderType::TrailingStop && !order.is_triggered {
                self.persist(order).await?;
            }
        }
        Ok(())
    }

    async fn handle_place_outcome(
        &mut self,
        ctx: &ActorContext<OrderManagerMsg>,
        local_id: u64,
        attempt: u32,
        result: Result<ExchangeAck, CoreError>,
    ) -> Result<(), CoreError> {
        let Some(order) = self.orders.get_mut(&local_id) else {
            debug!(component = "order-manager", local_id, "outcome for unknown order");
            return Ok(());
        };
        match result {
            Ok(ack) => {
                order.exchange_id = Some(ack.exchange_id);
                if !order.status.is_terminal() && order.status == OrderStatus::Pending {
                    order.transition(OrderStatus::Open, Utc::now())?;
                }
                order.updated_at = Utc::now();
                let snapshot = order.clone();
                info!(
                    component = "order-manager",
                    exchange = %self.exchange,
                    symbol = %snapshot.symbol,
                    local_id,
                    exchange_id = %snapshot.exchange_id.as_deref().unwrap_or(""),
                    "order accepted by venue"
                );
                self.persist(&snapshot).await?;
            }
            Err(CoreError::ExchangeReject(reason)) => {
                order.transition(OrderStatus::Rejected, Utc::now())?;
                let snapshot = order.clone();
                warn!(
                    component = "order-manager",
                    exchange = %self.exchange,
                    symbol = %snapshot.symbol,
                    local_id,
                    reason = %reason,
                    "order rejected by venue"
                );
                self.persist(&snapshot).await?;
                self.orders.remove(&local_id);
            }
            Err(err) if attempt == 1 && matches!(err, CoreError::Network(_)) => {
                warn!(
                    component = "order-manager",
                    exchange = %self.exchange,
                    local_id,
                    err = %err,
                    "transient place failure, retrying once"
                );
                let snapshot = order.clone();
                self.spawn_place(ctx, &snapshot, 2);
            }
            Err(err) => {
                // No conclusive venue answer: the order stays pending and
                // reconciliation resolves it after the next reconnect.
                error!(
                    component = "order-manager",
                    exchange = %self.exchange,
                    local_id,
                    err = %err,
                    "order placement failed"
                );
            }
        }
        Ok(())
    }

    async fn handle_exchange_update(&mut self, update: OrderUpdate) -> Result<(), CoreError> {
        let Some(order) = self
            .orders
            .values_mut()
            .find(|o| o.exchange_id.as_deref() == Some(update.exchange_id.as_str()))
        else {
            debug!(
                component = "order-manager",
                exchange = %self.exchange,
                exchange_id = %update.exchange_id,
                "update for unknown order"
            );
            return Ok(());
        };
        if order.status.is_terminal() {
            debug!(
                component = "order-manager",
                local_id = order.local_id,
                "ignoring update for terminal order"
            );
            return Ok(());
        }

        let fill_delta = update.filled_quantity - order.filled_quantity;
        order.filled_quantity = update.filled_quantity;
        if update.status != order.status {
            order.transition(update.status, update.timestamp)?;
        } else {
            order.updated_at = update.timestamp;
        }
        let snapshot = order.clone();
        self.persist(&snapshot).await?;
        if snapshot.status.is_terminal() {
            self.orders.remove(&snapshot.local_id);
        }

        if fill_delta > Decimal::ZERO
            && let Some(price) = update.fill_price
        {
            let trade = Trade {
                id: Uuid::new_v4(),
                exchange: self.exchange.clone(),
                symbol: snapshot.symbol.clone(),
                side: snapshot.side,
                quantity: fill_delta,
                price,
                fee: update.fee,
                timestamp: update.timestamp,
                order_local_id: snapshot.local_id,
            };
            self.trades_repo.append(&trade).await?;
            self.portfolio.tell(PortfolioMsg::TradeExecuted(trade)).await;
        }
        Ok(())
    }

    /// Merge venue-reported open orders after a reconnect. Orders are
    /// matched by exchange id, then by the client order id we stamped at
    /// placement; unmatched venue orders are adopted as new records.
    /// Trigger state on local records is never touched here, so trailing
    /// marks survive the reconnect.
    async fn handle_reconcile_outcome(
        &mut self,
        venue_orders: Vec<ExchangeOrder>,
    ) -> Result<(), CoreError> {
        for venue_order in venue_orders {
            let matched = self.orders.values_mut().find(|o| {
                o.exchange_id.as_deref() == Some(venue_order.exchange_id.as_str())
                    || venue_order
                        .client_order_id
                        .as_deref()
                        .is_some_and(|link| link == format!("{}-{}", o.exchange, o.local_id))
            });
            match matched {
                Some(order) => {
                    order.exchange_id = Some(venue_order.exchange_id.clone());
                    order.filled_quantity = venue_order.filled_quantity;
                    if venue_order.status != order.status && !order.status.is_terminal() {
                        order.transition(venue_order.status, Utc::now())?;
                    }
                    let snapshot = order.clone();
                    self.persist(&snapshot).await?;
                    debug!(
                        component = "order-manager",
                        local_id = snapshot.local_id,
                        exchange_id = %venue_order.exchange_id,
                        "order reconciled"
                    );
                }
                None => {
                    let local_id = self.next_local_id;
                    self.next_local_id += 1;
                    let now = Utc::now();
                    let order = Order {
                        local_id,
                        exchange_id: Some(venue_order.exchange_id.clone()),
                        exchange: self.exchange.clone(),
                        symbol: venue_order.symbol.clone(),
                        side: venue_order.side,
                        order_type: venue_order.order_type,
                        quantity: venue_order.quantity,
                        filled_quantity: venue_order.filled_quantity,
                        limit_price: venue_order.price,
                        stop_price: None,
                        trail_amount: None,
                        trail_percent: None,
                        time_in_force: None,
                        status: venue_order.status,
                        high_water_mark: None,
                        trigger_price: None,
                        is_triggered: false,
                        parent_local_id: None,
                        created_at: now,
                        updated_at: now,
                    };
                    warn!(
                        component = "order-manager",
                        exchange = %self.exchange,
                        exchange_id = %venue_order.exchange_id,
                        "adopting venue order unknown locally"
                    );
                    self.persist(&order).await?;
                    if !order.status.is_terminal() {
                        self.orders.insert(local_id, order);
                    }
                }
            }
        }
        info!(
            component = "order-manager",
            exchange = %self.exchange,
            open = self.orders.len(),
            "reconciliation complete"
        );
        Ok(())
    }
}

#[async_trait]
impl Actor for OrderManagerActor {
    type Msg = OrderManagerMsg;

    /// Restore open orders (including trailing trigger state) from the
    /// repository and resume local ids monotonically.
    async fn started(&mut self, _ctx: &ActorContext<OrderManagerMsg>) -> Result<(), CoreError> {
        let open = self.orders_repo.load_open(&self.exchange).await?;
        self.next_local_id = self.orders_repo.max_local_id(&self.exchange).await? + 1;
        for order in open {
            self.orders.insert(order.local_id, order);
        }
        if !self.orders.is_empty() {
            info!(
                component = "order-manager",
                exchange = %self.exchange,
                restored = self.orders.len(),
                "open orders restored from storage"
            );
        }
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: OrderManagerMsg,
        ctx: &ActorContext<OrderManagerMsg>,
    ) -> Result<(), CoreError> {
        match msg {
            OrderManagerMsg::Submit { intent, reply } => {
                let result = self.handle_submit(ctx, intent).await;
                let escalate = result
                    .as_ref()
                    .err()
                    .filter(|e| e.is_fatal())
                    .map(|e| e.to_string());
                let _ = reply.send(result);
                if let Some(message) = escalate {
                    return Err(CoreError::Integrity(message));
                }
                Ok(())
            }
            OrderManagerMsg::Cancel { local_id, reply } => {
                let Some(order) = self.orders.get(&local_id) else {
                    let _ = reply.send(Err(CoreError::Validation(format!(
                        "No open order with id {}",
                        local_id
                    ))));
                    return Ok(());
                };
                let venue_id = order.exchange_id.clone();
                let symbol = order.symbol.clone();
                let filled = order.filled_quantity;
                match venue_id {
                    Some(exchange_id) => {
                        // Venue-resident: cancel over REST, confirm by
                        // feeding the result back as an exchange update.
                        let client = self.client.clone();
                        let addr = ctx.addr();
                        tokio::spawn(async move {
                            let result = client.cancel_order(&symbol, &exchange_id).await;
                            if result.is_ok() {
                                addr.tell(OrderManagerMsg::ExchangeUpdate(OrderUpdate {
                                    exchange_id,
                                    symbol,
                                    status: OrderStatus::Cancelled,
                                    filled_quantity: filled,
                                    fill_price: None,
                                    fee: Decimal::ZERO,
                                    timestamp: Utc::now(),
                                }))
                                .await;
                            }
                            let _ = reply.send(result);
                        });
                    }
                    None => {
                        // Purely local (untriggered stop / trailing stop).
                        let mut order = self.orders.remove(&local_id).expect("order exists");
                        order.transition(OrderStatus::Cancelled, Utc::now())?;
                        self.persist(&order).await?;
                        let _ = reply.send(Ok(()));
                    }
                }
                Ok(())
            }
            OrderManagerMsg::PriceUpdate { symbol, price } => {
                self.handle_price_update(ctx, &symbol, price).await
            }
            OrderManagerMsg::ExchangeUpdate(update) => self.handle_exchange_update(update).await,
            OrderManagerMsg::PlaceOutcome {
                local_id,
                attempt,
                result,
            } => self.handle_place_outcome(ctx, local_id, attempt, result).await,
            OrderManagerMsg::Reconcile => {
                let client = self.client.clone();
                let addr = ctx.addr();
                tokio::spawn(async move {
                    let result = client.open_orders().await;
                    addr.tell(OrderManagerMsg::ReconcileOutcome { result }).await;
                });
                Ok(())
            }
            OrderManagerMsg::ReconcileOutcome { result } => match result {
                Ok(venue_orders) => self.handle_reconcile_outcome(venue_orders).await,
                Err(err) => {
                    warn!(
                        component = "order-manager",
                        exchange = %self.exchange,
                        err = %err,
                        "reconciliation fetch failed"
                    );
                    Ok(())
                }
            },
            OrderManagerMsg::OpenOrders { reply } => {
                let _ = reply.send(self.orders.values().cloned().collect());
                Ok(())
            }
            OrderManagerMsg::RecentOrders {
                symbol,
                limit,
                reply,
            } => {
                let result = self
                    .orders_repo
                    .recent(&self.exchange, symbol.as_deref(), limit)
                    .await;
                let _ = reply.send(result);
                Ok(())
            }
        }
    }
}
