//! Strategy actor: one script bound to one `(exchange, symbol, interval)`.
//!
//! Market data arrives as messages from the session's fan-out. Closed
//! klines roll into the window and drive `on_kline`; order books and
//! tickers invoke their callbacks directly. Emitted intents go through
//! the risk gate and, on approval, to the order manager. Script failures
//! abort the current callback only and land in the strategy log.

pub mod script;
pub mod window;

use crate::application::order_manager::OrderManagerMsg;
use crate::application::portfolio::PortfolioMsg;
use crate::application::risk_gate::{RiskGateMsg, RiskRequest};
use crate::domain::errors::CoreError;
use crate::domain::market::{Interval, Kline, OrderBookSnapshot, Ticker};
use crate::domain::order::OrderIntent;
use crate::runtime::{ASK_TIMEOUT, Actor, ActorContext, Addr};
use async_trait::async_trait;
use rust_decimal::Decimal;
use script::ScriptHost;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use window::KlineWindow;

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyStatus {
    pub id: String,
    pub script: String,
    pub exchange: String,
    pub symbol: String,
    pub interval: Interval,
    pub active: bool,
    pub window_len: usize,
    pub signals_emitted: u64,
    pub orders_submitted: u64,
    pub orders_rejected: u64,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
}

pub enum StrategyMsg {
    Kline(Kline),
    OrderBook(OrderBookSnapshot),
    Ticker(Ticker),
    /// Historical klines fetched at startup; fills the window without
    /// invoking callbacks.
    Backfill(Vec<Kline>),
    SetActive(bool),
    Status {
        reply: oneshot::Sender<StrategyStatus>,
    },
    Logs {
        reply: oneshot::Sender<Vec<String>>,
    },
}

pub struct StrategyActor {
    exchange: String,
    symbol: String,
    script_name: String,
    interval: Interval,
    host: ScriptHost,
    window: KlineWindow,
    active: bool,
    risk_gate: Addr<RiskGateMsg>,
    order_manager: Addr<OrderManagerMsg>,
    portfolio: Addr<PortfolioMsg>,
    last_price: Decimal,
    signals_emitted: u64,
    orders_submitted: u64,
    orders_rejected: u64,
}

impl StrategyActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: String,
        symbol: String,
        script_name: String,
        interval: Interval,
        host: ScriptHost,
        window_capacity: usize,
        risk_gate: Addr<RiskGateMsg>,
        order_manager: Addr<OrderManagerMsg>,
        portfolio: Addr<PortfolioMsg>,
    ) -> Self {
        StrategyActor {
            exchange,
            symbol,
            script_name,
            interval,
            host,
            window: KlineWindow::new(window_capacity),
            active: true,
            risk_gate,
            order_manager,
            portfolio,
            last_price: Decimal::ZERO,
            signals_emitted: 0,
            orders_submitted: 0,
            orders_rejected: 0,
        }
    }

    pub fn id(exchange: &str, symbol: &str, script_name: &str) -> String {
        format!("{}:{}:{}", exchange, symbol, script_name)
    }

    /// Refresh the snapshots scripts read through `position()`/`balances()`.
    async fn refresh_account_view(&mut self) {
        let position = self
            .portfolio
            .ask(
                |reply| PortfolioMsg::PositionFor {
                    symbol: self.symbol.clone(),
                    reply,
                },
                ASK_TIMEOUT,
            )
            .await;
        if let Ok(position) = position {
            self.host.set_position(position);
        }
        if let Ok(balances) = self
            .portfolio
            .ask(|reply| PortfolioMsg::Balances { reply }, ASK_TIMEOUT)
            .await
        {
            self.host.set_balances(balances);
        }
    }

    async fn route_intents(&mut self, intents: Vec<OrderIntent>) {
        for intent in intents {
            self.signals_emitted += 1;
            let price = intent.limit_price.unwrap_or(self.last_price);
            if price <= Decimal::ZERO {
                warn!(
                    component = "strategy",
                    strategy = %self.script_name,
                    symbol = %self.symbol,
                    "dropping intent with no reference price"
                );
                continue;
            }
            let request = RiskRequest {
                symbol: intent.symbol.clone(),
                side: intent.side,
                quantity: intent.quantity,
                price,
            };
            let verdict = self
                .risk_gate
                .ask(
                    |reply| RiskGateMsg::Validate { request, reply },
                    ASK_TIMEOUT,
                )
                .await;
            match verdict {
                Ok(Ok(())) => {
                    let submitted = self
                        .order_manager
                        .ask(
                            |reply| OrderManagerMsg::Submit { intent, reply },
                            ASK_TIMEOUT,
                        )
                        .await;
                    match submitted {
                        Ok(Ok(order)) => {
                            self.orders_submitted += 1;
                            self.host.push_log(format!(
                                "order {} {} {} {} accepted (local id {})",
                                order.side,
                                order.quantity,
                                order.symbol,
                                order.order_type,
                                order.local_id
                            ));
                        }
                        Ok(Err(err)) | Err(err) => {
                            self.orders_rejected += 1;
                            self.host.push_log(format!("order submission failed: {}", err));
                            warn!(
                                component = "strategy",
                                strategy = %self.script_name,
                                symbol = %self.symbol,
                                err = %err,
                                "order submission failed"
                            );
                        }
                    }
                }
                Ok(Err(err)) => {
                    self.orders_rejected += 1;
                    self.host.push_log(format!("risk rejection: {}", err));
                    info!(
                        component = "strategy",
                        strategy = %self.script_name,
                        symbol = %self.symbol,
                        reason = %err,
                        "intent rejected by risk gate"
                    );
                }
                Err(err) => {
                    self.orders_rejected += 1;
                    self.host.push_log(format!("risk gate unavailable: {}", err));
                }
            }
        }
    }

    fn log_script_error(&self, err: &CoreError) {
        self.host.push_log(err.to_string());
        warn!(
            component = "strategy",
            exchange = %self.exchange,
            strategy = %self.script_name,
            symbol = %self.symbol,
            err = %err,
            "script callback failed"
        );
    }

    async fn status(&self) -> StrategyStatus {
        let position = self
            .portfolio
            .ask(
                |reply| PortfolioMsg::PositionFor {
                    symbol: self.symbol.clone(),
                    reply,
                },
                ASK_TIMEOUT,
            )
            .await
            .ok()
            .flatten();
        let valuation = self
            .portfolio
            .ask(|reply| PortfolioMsg::Valuation { reply }, ASK_TIMEOUT)
            .await
            .ok();
        StrategyStatus {
            id: Self::id(&self.exchange, &self.symbol, &self.script_name),
            script: self.script_name.clone(),
            exchange: self.exchange.clone(),
            symbol: self.symbol.clone(),
            interval: self.interval,
            active: self.active,
            window_len: self.window.len(),
            signals_emitted: self.signals_emitted,
            orders_submitted: self.orders_submitted,
            orders_rejected: self.orders_rejected,
            realized_pnl: valuation.map(|v| v.realized_pnl).unwrap_or(Decimal::ZERO),
            unrealized_pnl: position.map(|p| p.unrealized_pnl).unwrap_or(Decimal::ZERO),
        }
    }
}

#[async_trait]
impl Actor for StrategyActor {
    type Msg = StrategyMsg;

    async fn handle(
        &mut self,
        msg: StrategyMsg,
        _ctx: &ActorContext<StrategyMsg>,
    ) -> Result<(), CoreError> {
        match msg {
            StrategyMsg::Kline(kline) => {
                if kline.symbol != self.symbol || kline.interval != self.interval {
                    return Ok(());
                }
                self.last_price = kline.close;
                self.window.push(kline.clone());
                if !self.active || !kline.closed || !self.host.has_on_kline() {
                    return Ok(());
                }
                self.host.update_series(
                    self.window.opens(),
                    self.window.highs(),
                    self.window.lows(),
                    self.window.closes(),
                    self.window.volumes(),
                );
                self.refresh_account_view().await;
                match self.host.on_kline(&kline) {
                    Ok(intents) => self.route_intents(intents).await,
                    Err(err) => self.log_script_error(&err),
                }
                Ok(())
            }
            StrategyMsg::OrderBook(book) => {
                if book.symbol != self.symbol || !self.active || !self.host.has_on_orderbook() {
                    return Ok(());
                }
                match self.host.on_orderbook(&book) {
                    Ok(intents) => self.route_intents(intents).await,
                    Err(err) => self.log_script_error(&err),
                }
                Ok(())
            }
            StrategyMsg::Ticker(ticker) => {
                if ticker.symbol != self.symbol {
                    return Ok(());
                }
                self.last_price = ticker.price;
                if !self.active || !self.host.has_on_ticker() {
                    return Ok(());
                }
                match self.host.on_ticker(&ticker) {
                    Ok(intents) => self.route_intents(intents).await,
                    Err(err) => self.log_script_error(&err),
                }
                Ok(())
            }
            StrategyMsg::Backfill(klines) => {
                // Only seed an empty window; once live bars have landed a
                // late backfill would corrupt the series ordering.
                if !self.window.is_empty() {
                    debug!(
                        component = "strategy",
                        strategy = %self.script_name,
                        symbol = %self.symbol,
                        "live data already flowing, backfill dropped"
                    );
                    return Ok(());
                }
                for kline in klines {
                    if kline.symbol == self.symbol && kline.interval == self.interval {
                        self.last_price = kline.close;
                        self.window.push(kline);
                    }
                }
                debug!(
                    component = "strategy",
                    strategy = %self.script_name,
                    symbol = %self.symbol,
                    window = self.window.len(),
                    "window backfilled from history"
                );
                Ok(())
            }
            StrategyMsg::SetActive(active) => {
                self.active = active;
                debug!(
                    component = "strategy",
                    strategy = %self.script_name,
                    symbol = %self.symbol,
                    active,
                    "activation changed"
                );
                Ok(())
            }
            StrategyMsg::Status { reply } => {
                let _ = reply.send(self.status().await);
                Ok(())
            }
            StrategyMsg::Logs { reply } => {
                let _ = reply.send(self.host.drain_logs());
                Ok(())
            }
        }
    }
}
