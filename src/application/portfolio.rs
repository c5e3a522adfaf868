//! Balances, positions and PnL for one exchange.
//!
//! Positions are derived from executed trades: same-side fills accumulate
//! as lots (weighted-average entry for reporting), opposite-side fills
//! realize PnL against the oldest lots first (FIFO). A periodic sync
//! adopts the exchange's authoritative view and logs any drift.

use crate::domain::errors::CoreError;
use crate::domain::order::OrderSide;
use crate::domain::portfolio::{Balance, Position, Trade};
use crate::domain::ports::{ExchangeClient, PortfolioSnapshotRecord};
use crate::domain::repositories::SnapshotRepository;
use crate::runtime::{Actor, ActorContext};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub const SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Valuation snapshot used by the risk gate.
#[derive(Debug, Clone, PartialEq)]
pub struct Valuation {
    pub portfolio_value: Decimal,
    pub available_cash: Decimal,
    pub open_positions: u32,
    pub gross_exposure: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
}

impl Valuation {
    pub fn leverage(&self) -> Decimal {
        if self.portfolio_value > Decimal::ZERO {
            self.gross_exposure / self.portfolio_value
        } else {
            Decimal::ZERO
        }
    }
}

/// Gateway-facing summary.
#[derive(Debug, Clone)]
pub struct PortfolioSummary {
    pub exchange: String,
    pub balances: Vec<Balance>,
    pub positions: Vec<Position>,
    pub available_cash: Decimal,
    pub portfolio_value: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
}

pub enum PortfolioMsg {
    TradeExecuted(Trade),
    PriceUpdate {
        symbol: String,
        price: Decimal,
    },
    Valuation {
        reply: oneshot::Sender<Valuation>,
    },
    Summary {
        reply: oneshot::Sender<PortfolioSummary>,
    },
    PositionFor {
        symbol: String,
        reply: oneshot::Sender<Option<Position>>,
    },
    Balances {
        reply: oneshot::Sender<Vec<Balance>>,
    },
    Sync,
    SyncResult {
        result: Result<(Vec<Balance>, Vec<Position>), CoreError>,
    },
}

#[derive(Debug, Clone, Copy)]
struct Lot {
    quantity: Decimal,
    price: Decimal,
}

/// FIFO lot book for one symbol. All lots share one sign; an opposite-side
/// fill consumes from the front and flips the book when it overshoots.
#[derive(Debug, Default)]
pub struct PositionBook {
    lots: VecDeque<Lot>,
    current_price: Decimal,
    updated_at: Option<DateTime<Utc>>,
}

impl PositionBook {
    pub fn quantity(&self) -> Decimal {
        self.lots.iter().map(|l| l.quantity).sum()
    }

    pub fn average_price(&self) -> Decimal {
        let quantity = self.quantity();
        if quantity == Decimal::ZERO {
            return Decimal::ZERO;
        }
        let notional: Decimal = self.lots.iter().map(|l| l.quantity * l.price).sum();
        notional / quantity
    }

    /// Apply a signed fill; returns the realized PnL from any closed lots.
    pub fn apply(&mut self, mut quantity: Decimal, price: Decimal, now: DateTime<Utc>) -> Decimal {
        self.updated_at = Some(now);
        self.current_price = price;
        let mut realized = Decimal::ZERO;

        let book_sign = self.quantity().signum();
        if book_sign == Decimal::ZERO || book_sign == quantity.signum() {
            self.lots.push_back(Lot { quantity, price });
            return realized;
        }

        // Opposite side: consume oldest lots first.
        while quantity != Decimal::ZERO {
            let Some(front) = self.lots.front_mut() else {
                // Overshoot flips the book.
                self.lots.push_back(Lot { quantity, price });
                break;
            };
            let closing = front.quantity.abs().min(quantity.abs());
            let lot_sign = front.quantity.signum();
            // Long lots realize (exit - entry), shorts the reverse.
            realized += (price - front.price) * closing * lot_sign;
            front.quantity -= closing * lot_sign;
            quantity += closing * lot_sign;
            if front.quantity == Decimal::ZERO {
                self.lots.pop_front();
            }
        }
        realized
    }

    pub fn mark(&mut self, price: Decimal, now: DateTime<Utc>) {
        self.current_price = price;
        self.updated_at = Some(now);
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        (self.current_price - self.average_price()) * self.quantity()
    }

    fn as_position(&self, symbol: &str) -> Position {
        Position {
            symbol: symbol.to_string(),
            quantity: self.quantity(),
            average_price: self.average_price(),
            current_price: self.current_price,
            unrealized_pnl: self.unrealized_pnl(),
            updated_at: self.updated_at.unwrap_or_else(Utc::now),
        }
    }
}

pub struct PortfolioActor {
    exchange: String,
    quote_asset: String,
    client: Arc<dyn ExchangeClient>,
    snapshots: Option<Arc<dyn SnapshotRepository>>,
    balances: HashMap<String, Balance>,
    books: HashMap<String, PositionBook>,
    realized_pnl: Decimal,
    sync_interval: Duration,
}

impl PortfolioActor {
    pub fn new(
        exchange: String,
        client: Arc<dyn ExchangeClient>,
        snapshots: Option<Arc<dyn SnapshotRepository>>,
    ) -> Self {
        PortfolioActor {
            exchange,
            quote_asset: "USDT".to_string(),
            client,
            snapshots,
            balances: HashMap::new(),
            books: HashMap::new(),
            realized_pnl: Decimal::ZERO,
            sync_interval: SYNC_INTERVAL,
        }
    }

    #[doc(hidden)]
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    fn positions(&self) -> Vec<Position> {
        self.books
            .iter()
            .filter(|(_, book)| book.quantity() != Decimal::ZERO)
            .map(|(symbol, book)| book.as_position(symbol))
            .collect()
    }

    fn valuation(&self) -> Valuation {
        let cash_total: Decimal = self
            .balances
            .get(&self.quote_asset)
            .map(|b| b.total())
            .unwrap_or(Decimal::ZERO);
        let available_cash = self
            .balances
            .get(&self.quote_asset)
            .map(|b| b.available)
            .unwrap_or(Decimal::ZERO);
        let mut gross = Decimal::ZERO;
        let mut net = Decimal::ZERO;
        let mut unrealized = Decimal::ZERO;
        for book in self.books.values() {
            let notional = book.quantity() * book.current_price;
            gross += notional.abs();
            net += notional;
            unrealized += book.unrealized_pnl();
        }
        Valuation {
            portfolio_value: cash_total + net,
            available_cash,
            open_positions: self
                .books
                .values()
                .filter(|b| b.quantity() != Decimal::ZERO)
                .count() as u32,
            gross_exposure: gross,
            realized_pnl: self.realized_pnl,
            unrealized_pnl: unrealized,
        }
    }

    fn summary(&self) -> PortfolioSummary {
        let valuation = self.valuation();
        PortfolioSummary {
            exchange: self.exchange.clone(),
            balances: self.balances.values().cloned().collect(),
            positions: self.positions(),
            available_cash: valuation.available_cash,
            portfolio_value: valuation.portfolio_value,
            realized_pnl: valuation.realized_pnl,
            unrealized_pnl: valuation.unrealized_pnl,
        }
    }

    fn adopt_exchange_view(&mut self, balances: Vec<Balance>, positions: Vec<Position>) {
        for balance in &balances {
            if let Some(local) = self.balances.get(&balance.asset)
                && local.total() != balance.total()
            {
                warn!(
                    component = "portfolio",
                    exchange = %self.exchange,
                    asset = %balance.asset,
                    local = %local.total(),
                    venue = %balance.total(),
                    "balance drift, adopting exchange view"
                );
            }
        }
        self.balances = balances
            .into_iter()
            .map(|b| (b.asset.clone(), b))
            .collect();

        let now = Utc::now();
        for position in positions {
            let local = self
                .books
                .get(&position.symbol)
                .map(|b| b.quantity())
                .unwrap_or(Decimal::ZERO);
            if local != position.quantity {
                warn!(
                    component = "portfolio",
                    exchange = %self.exchange,
                    symbol = %position.symbol,
                    local = %local,
                    venue = %position.quantity,
                    "position drift, adopting exchange view"
                );
            }
            let book = self.books.entry(position.symbol.clone()).or_default();
            book.lots.clear();
            if position.quantity != Decimal::ZERO {
                book.lots.push_back(Lot {
                    quantity: position.quantity,
                    price: position.average_price,
                });
            }
            book.mark(position.current_price, now);
        }
    }

    async fn persist_snapshot(&self) {
        let Some(snapshots) = &self.snapshots else {
            return;
        };
        let valuation = self.valuation();
        let record = PortfolioSnapshotRecord {
            exchange: self.exchange.clone(),
            equity: valuation.portfolio_value,
            cash: valuation.available_cash,
            realized_pnl: valuation.realized_pnl,
            unrealized_pnl: valuation.unrealized_pnl,
            taken_at: Utc::now(),
        };
        if let Err(err) = snapshots.append(&record).await {
            warn!(component = "portfolio", err = %err, "failed to persist snapshot");
        }
    }
}

#[async_trait]
impl Actor for PortfolioActor {
    type Msg = PortfolioMsg;

    async fn started(&mut self, ctx: &ActorContext<PortfolioMsg>) -> Result<(), CoreError> {
        let addr = ctx.addr();
        let interval = self.sync_interval;
        tokio::spawn(async move {
            loop {
                addr.tell(PortfolioMsg::Sync).await;
                tokio::time::sleep(interval).await;
            }
        });
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: PortfolioMsg,
        ctx: &ActorContext<PortfolioMsg>,
    ) -> Result<(), CoreError> {
        match msg {
            PortfolioMsg::TradeExecuted(trade) => {
                let signed = match trade.side {
                    OrderSide::Buy => trade.quantity,
                    OrderSide::Sell => -trade.quantity,
                };
                let book = self.books.entry(trade.symbol.clone()).or_default();
                let realized = book.apply(signed, trade.price, trade.timestamp);
                self.realized_pnl += realized - trade.fee;
                // Cash moves immediately; the periodic sync trues it up.
                if let Some(cash) = self.balances.get_mut(&self.quote_asset) {
                    cash.available -= signed * trade.price + trade.fee;
                    cash.updated_at = trade.timestamp;
                }
                debug!(
                    component = "portfolio",
                    exchange = %self.exchange,
                    symbol = %trade.symbol,
                    realized = %realized,
                    "trade applied"
                );
                Ok(())
            }
            PortfolioMsg::PriceUpdate { symbol, price } => {
                if let Some(book) = self.books.get_mut(&symbol) {
                    book.mark(price, Utc::now());
                }
                Ok(())
            }
            PortfolioMsg::Valuation { reply } => {
                let _ = reply.send(self.valuation());
                Ok(())
            }
            PortfolioMsg::Summary { reply } => {
                let _ = reply.send(self.summary());
                Ok(())
            }
            PortfolioMsg::PositionFor { symbol, reply } => {
                let position = self
                    .books
                    .get(&symbol)
                    .filter(|b| b.quantity() != Decimal::ZERO)
                    .map(|b| b.as_position(&symbol));
                let _ = reply.send(position);
                Ok(())
            }
            PortfolioMsg::Balances { reply } => {
                let _ = reply.send(self.balances.values().cloned().collect());
                Ok(())
            }
            PortfolioMsg::Sync => {
                let client = self.client.clone();
                let addr = ctx.addr();
                tokio::spawn(async move {
                    let result: Result<_, CoreError> = async {
                        let balances = client.balances().await?;
                        let positions = client.positions().await?;
                        Ok((balances, positions))
                    }
                    .await;
                    addr.tell(PortfolioMsg::SyncResult { result }).await;
                });
                Ok(())
            }
            PortfolioMsg::SyncResult { result } => {
                match result {
                    Ok((balances, positions)) => {
                        self.adopt_exchange_view(balances, positions);
                        self.persist_snapshot().await;
                        info!(
                            component = "portfolio",
                            exchange = %self.exchange,
                            assets = self.balances.len(),
                            "synchronized with exchange"
                        );
                    }
                    Err(err) => {
                        warn!(
                            component = "portfolio",
                            exchange = %self.exchange,
                            err = %err,
                            "exchange sync failed"
                        );
                    }
                }
                Ok(())
            }
        }
    }
}

/// Test seam: preload balances without a venue round-trip.
impl PortfolioActor {
    #[doc(hidden)]
    pub fn with_balances(mut self, balances: Vec<Balance>) -> Self {
        self.balances = balances.into_iter().map(|b| (b.asset.clone(), b)).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn apply(book: &mut PositionBook, quantity: Decimal, price: Decimal) -> Decimal {
        book.apply(quantity, price, Utc::now())
    }

    #[test]
    fn same_side_fills_accumulate_with_weighted_average() {
        let mut book = PositionBook::default();
        apply(&mut book, dec!(1), dec!(100));
        apply(&mut book, dec!(1), dec!(110));
        assert_eq!(book.quantity(), dec!(2));
        assert_eq!(book.average_price(), dec!(105));
    }

    #[test]
    fn opposite_fill_realizes_fifo() {
        let mut book = PositionBook::default();
        apply(&mut book, dec!(1), dec!(100));
        apply(&mut book, dec!(1), dec!(110));
        // Sell 1.5 at 120: closes the 100 lot fully and half the 110 lot.
        let realized = apply(&mut book, dec!(-1.5), dec!(120));
        assert_eq!(realized, dec!(20) + dec!(5));
        assert_eq!(book.quantity(), dec!(0.5));
        assert_eq!(book.average_price(), dec!(110));
    }

    #[test]
    fn overshoot_flips_the_book() {
        let mut book = PositionBook::default();
        apply(&mut book, dec!(1), dec!(100));
        let realized = apply(&mut book, dec!(-2), dec!(90));
        assert_eq!(realized, dec!(-10));
        assert_eq!(book.quantity(), dec!(-1));
        assert_eq!(book.average_price(), dec!(90));
    }

    #[test]
    fn short_positions_realize_inverted() {
        let mut book = PositionBook::default();
        apply(&mut book, dec!(-2), dec!(100));
        let realized = apply(&mut book, dec!(1), dec!(80));
        // Short from 100, covered at 80: +20 per unit.
        assert_eq!(realized, dec!(20));
        assert_eq!(book.quantity(), dec!(-1));
    }

    #[test]
    fn unrealized_follows_mark() {
        let mut book = PositionBook::default();
        apply(&mut book, dec!(2), dec!(100));
        book.mark(dec!(110), Utc::now());
        assert_eq!(book.unrealized_pnl(), dec!(20));
    }
}
