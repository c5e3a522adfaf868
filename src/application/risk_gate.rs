//! Pre-trade risk validation for one exchange.
//!
//! Every order intent passes through `Validate` before it may reach the
//! order manager. Checks run in a fixed order and the first failure wins;
//! crossing 80% of any cap logs a warning without rejecting. Approved
//! orders update the daily ledger, which resets at midnight UTC via a
//! timer message and keeps a 30-day volume window plus a bounded order
//! history.
//!
//! Parameters are read through the settings component on every validation
//! (no caching) with the static config as fallback.

use crate::application::portfolio::PortfolioMsg;
use crate::application::settings::SettingsMsg;
use crate::config::RiskConfig;
use crate::domain::errors::CoreError;
use crate::domain::order::OrderSide;
use crate::runtime::{ASK_TIMEOUT, Actor, ActorContext, Addr};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use statrs::statistics::{Data, Distribution};
use std::collections::{BTreeMap, VecDeque};
use std::str::FromStr;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Order history bound.
const ORDER_HISTORY_CAP: usize = 1000;
/// Days of daily-volume history retained past a midnight reset.
const VOLUME_RETENTION_DAYS: i64 = 30;
/// 95th-percentile z-score for the historical VaR estimate.
const VAR95_Z: f64 = 1.645;

#[derive(Debug, Clone, PartialEq)]
pub struct RiskRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskMetrics {
    pub max_drawdown: Decimal,
    pub current_drawdown: Decimal,
    pub var95: Decimal,
    pub position_concentration: Decimal,
    pub leverage_ratio: Decimal,
    pub daily_risk_limit: Decimal,
    pub daily_risk_used: Decimal,
    pub daily_volume_used: Decimal,
}

pub enum RiskGateMsg {
    Validate {
        request: RiskRequest,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    MidnightReset,
    Metrics {
        reply: oneshot::Sender<Result<RiskMetrics, CoreError>>,
    },
    GetParam {
        key: String,
        reply: oneshot::Sender<Result<Option<String>, CoreError>>,
    },
    SetParam {
        key: String,
        value: String,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    value: Decimal,
    at: chrono::DateTime<Utc>,
}

/// In-memory risk ledger. All mutation happens inside the risk gate's
/// serialized mailbox.
#[derive(Debug, Default)]
pub struct RiskLedger {
    daily_volume: BTreeMap<NaiveDate, Decimal>,
    daily_risk_used: Decimal,
    order_history: VecDeque<LedgerEntry>,
    high_water: Decimal,
    max_drawdown_seen: Decimal,
    daily_values: BTreeMap<NaiveDate, f64>,
}

impl RiskLedger {
    pub fn volume_for(&self, day: NaiveDate) -> Decimal {
        self.daily_volume.get(&day).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn daily_risk_used(&self) -> Decimal {
        self.daily_risk_used
    }

    pub fn order_history_len(&self) -> usize {
        self.order_history.len()
    }

    /// Track a portfolio valuation: advances the high-water mark and the
    /// per-day value series, returns the current drawdown fraction.
    pub fn observe_value(&mut self, value: Decimal, day: NaiveDate) -> Decimal {
        if value > self.high_water {
            self.high_water = value;
        }
        if let Some(v) = value.to_f64() {
            self.daily_values.insert(day, v);
            while self.daily_values.len() > 90 {
                let oldest = *self.daily_values.keys().next().expect("non-empty");
                self.daily_values.remove(&oldest);
            }
        }
        let drawdown = self.current_drawdown(value);
        if drawdown > self.max_drawdown_seen {
            self.max_drawdown_seen = drawdown;
        }
        drawdown
    }

    pub fn current_drawdown(&self, value: Decimal) -> Decimal {
        if self.high_water > Decimal::ZERO {
            (self.high_water - value) / self.high_water
        } else {
            Decimal::ZERO
        }
    }

    pub fn record_approval(&mut self, symbol: &str, order_value: Decimal, day: NaiveDate) {
        *self.daily_volume.entry(day).or_insert(Decimal::ZERO) += order_value;
        self.daily_risk_used += order_value;
        self.order_history.push_back(LedgerEntry {
            value: order_value,
            at: Utc::now(),
        });
        while self.order_history.len() > ORDER_HISTORY_CAP {
            self.order_history.pop_front();
        }
        tracing::debug!(
            component = "risk-gate",
            symbol,
            value = %order_value,
            "order value recorded in risk ledger"
        );
    }

    /// Approved order value recorded in the history for one day. Agrees
    /// with `volume_for` while the history window covers the day.
    pub fn history_value_for(&self, day: NaiveDate) -> Decimal {
        self.order_history
            .iter()
            .filter(|e| e.at.date_naive() == day)
            .map(|e| e.value)
            .sum()
    }

    /// Midnight rollover: zero the daily risk budget and drop volume
    /// entries older than the retention window.
    pub fn midnight_reset(&mut self, today: NaiveDate) {
        self.daily_risk_used = Decimal::ZERO;
        let cutoff = today - ChronoDuration::days(VOLUME_RETENTION_DAYS);
        self.daily_volume.retain(|day, _| *day >= cutoff);
    }

    /// Standard deviation of daily simple returns over the value series.
    fn daily_return_sigma(&self) -> f64 {
        let values: Vec<f64> = self.daily_values.values().copied().collect();
        if values.len() < 2 {
            return 0.0;
        }
        let returns: Vec<f64> = values
            .windows(2)
            .filter(|w| w[0] != 0.0)
            .map(|w| w[1] / w[0] - 1.0)
            .collect();
        if returns.len() < 2 {
            return 0.0;
        }
        Data::new(returns).std_dev().unwrap_or(0.0)
    }
}

pub struct RiskGateActor {
    exchange: String,
    config: RiskConfig,
    settings: Addr<SettingsMsg>,
    portfolio: Addr<PortfolioMsg>,
    ledger: RiskLedger,
}

impl RiskGateActor {
    pub fn new(
        exchange: String,
        config: RiskConfig,
        settings: Addr<SettingsMsg>,
        portfolio: Addr<PortfolioMsg>,
    ) -> Self {
        RiskGateActor {
            exchange,
            config,
            settings,
            portfolio,
            ledger: RiskLedger::default(),
        }
    }

    /// Read-through parameter lookup with config fallback.
    async fn param(&self, key: &str, fallback: Decimal) -> Decimal {
        let fetched = self
            .settings
            .ask(
                |reply| SettingsMsg::Get {
                    key: key.to_string(),
                    reply,
                },
                ASK_TIMEOUT,
            )
            .await;
        match fetched {
            Ok(Ok(Some(raw))) => match Decimal::from_str(&raw) {
                Ok(value) => value,
                Err(_) => {
                    warn!(
                        component = "risk-gate",
                        exchange = %self.exchange,
                        key,
                        raw,
                        "unparsable risk parameter, using fallback"
                    );
                    fallback
                }
            },
            _ => fallback,
        }
    }

    fn warn_usage(&self, what: &str, used: Decimal, cap: Decimal) {
        if cap > Decimal::ZERO && used / cap > Decimal::new(80, 2) {
            warn!(
                component = "risk-gate",
                exchange = %self.exchange,
                what,
                used = %used,
                cap = %cap,
                "usage above 80% of cap"
            );
        }
    }

    async fn validate(&mut self, request: &RiskRequest) -> Result<(), CoreError> {
        let valuation = self
            .portfolio
            .ask(|reply| PortfolioMsg::Valuation { reply }, ASK_TIMEOUT)
            .await?;
        let today = Utc::now().date_naive();
        let portfolio_value = valuation.portfolio_value;
        let drawdown = self.ledger.observe_value(portfolio_value, today);
        let order_value = request.quantity * request.price;

        let max_position_size = self
            .param("max_position_size", self.config.max_position_size)
            .await;
        let max_daily_volume = self
            .param("max_daily_volume", self.config.max_daily_volume)
            .await;
        let max_daily_risk = self.param("max_daily_risk", self.config.max_daily_risk).await;
        let max_drawdown = self.param("max_drawdown", self.config.max_drawdown).await;

        // 1. Position size cap.
        let position_limit = portfolio_value * max_position_size;
        if order_value > position_limit {
            return Err(CoreError::Validation(format!(
                "Order value {:.2} exceeds max position size limit {:.2}",
                order_value, position_limit
            )));
        }

        // 2. Daily volume cap.
        let volume_limit = portfolio_value * max_daily_volume;
        let volume_after = self.ledger.volume_for(today) + order_value;
        if volume_after > volume_limit {
            return Err(CoreError::Validation(format!(
                "Daily volume {:.2} would exceed limit {:.2}",
                volume_after, volume_limit
            )));
        }

        // 3. Affordability, buys only.
        if request.side == OrderSide::Buy && order_value > valuation.available_cash {
            return Err(CoreError::Validation(format!(
                "Order value {:.2} exceeds available cash {:.2}",
                order_value, valuation.available_cash
            )));
        }

        // 4. Daily risk budget.
        let risk_limit = portfolio_value * max_daily_risk;
        let risk_after = self.ledger.daily_risk_used() + order_value;
        if risk_after > risk_limit {
            return Err(CoreError::Validation(format!(
                "Daily risk used {:.2} would exceed limit {:.2}",
                risk_after, risk_limit
            )));
        }

        // 5. Drawdown lockout.
        if drawdown > max_drawdown {
            return Err(CoreError::Validation(format!(
                "Current drawdown {:.2}% exceeds maximum allowed {:.2}%",
                drawdown * Decimal::ONE_HUNDRED,
                max_drawdown * Decimal::ONE_HUNDRED
            )));
        }

        self.warn_usage("position size", order_value, position_limit);
        self.warn_usage("daily volume", volume_after, volume_limit);
        self.warn_usage("daily risk", risk_after, risk_limit);

        self.ledger.record_approval(&request.symbol, order_value, today);
        Ok(())
    }

    async fn metrics(&mut self) -> Result<RiskMetrics, CoreError> {
        let summary = self
            .portfolio
            .ask(|reply| PortfolioMsg::Summary { reply }, ASK_TIMEOUT)
            .await?;
        let today = Utc::now().date_naive();
        let portfolio_value = summary.portfolio_value;
        self.ledger.observe_value(portfolio_value, today);

        let gross: Decimal = summary.positions.iter().map(|p| p.notional()).sum();
        let largest: Decimal = summary
            .positions
            .iter()
            .map(|p| p.notional())
            .max()
            .unwrap_or(Decimal::ZERO);
        let concentration = if portfolio_value > Decimal::ZERO {
            largest / portfolio_value
        } else {
            Decimal::ZERO
        };
        let leverage = if portfolio_value > Decimal::ZERO {
            gross / portfolio_value
        } else {
            Decimal::ZERO
        };

        let sigma = self.ledger.daily_return_sigma();
        let var95 = portfolio_value
            * Decimal::from_f64_retain(sigma * VAR95_Z).unwrap_or(Decimal::ZERO);

        let max_daily_risk = self.param("max_daily_risk", self.config.max_daily_risk).await;
        Ok(RiskMetrics {
            max_drawdown: self.ledger.max_drawdown_seen,
            current_drawdown: self.ledger.current_drawdown(portfolio_value),
            var95,
            position_concentration: concentration,
            leverage_ratio: leverage,
            daily_risk_limit: portfolio_value * max_daily_risk,
            daily_risk_used: self.ledger.daily_risk_used(),
            daily_volume_used: self.ledger.volume_for(today),
        })
    }
}

#[async_trait]
impl Actor for RiskGateActor {
    type Msg = RiskGateMsg;

    /// Arm the midnight-UTC reset timer. The timer task only sends
    /// messages; all ledger mutation stays in the mailbox.
    async fn started(&mut self, ctx: &ActorContext<RiskGateMsg>) -> Result<(), CoreError> {
        let addr = ctx.addr();
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next_midnight = (now.date_naive() + ChronoDuration::days(1))
                    .and_hms_opt(0, 0, 0)
                    .expect("midnight is a valid time")
                    .and_utc();
                let wait = (next_midnight - now)
                    .to_std()
                    .unwrap_or(std::time::Duration::from_secs(1));
                tokio::time::sleep(wait).await;
                addr.tell(RiskGateMsg::MidnightReset).await;
            }
        });
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: RiskGateMsg,
        _ctx: &ActorContext<RiskGateMsg>,
    ) -> Result<(), CoreError> {
        match msg {
            RiskGateMsg::Validate { request, reply } => {
                let result = self.validate(&request).await;
                if let Err(err) = &result {
                    info!(
                        component = "risk-gate",
                        exchange = %self.exchange,
                        symbol = %request.symbol,
                        side = %request.side,
                        reason = %err,
                        "order intent rejected"
                    );
                }
                let _ = reply.send(result);
                Ok(())
            }
            RiskGateMsg::MidnightReset => {
                let today = Utc::now().date_naive();
                self.ledger.midnight_reset(today);
                info!(
                    component = "risk-gate",
                    exchange = %self.exchange,
                    day = %today,
                    "daily risk counters reset"
                );
                Ok(())
            }
            RiskGateMsg::Metrics { reply } => {
                let result = self.metrics().await;
                let _ = reply.send(result);
                Ok(())
            }
            RiskGateMsg::GetParam { key, reply } => {
                let result = self
                    .settings
                    .ask(
                        |inner| SettingsMsg::Get { key, reply: inner },
                        ASK_TIMEOUT,
                    )
                    .await
                    .and_then(|r| r);
                let _ = reply.send(result);
                Ok(())
            }
            RiskGateMsg::SetParam { key, value, reply } => {
                let result = self
                    .settings
                    .ask(
                        |inner| SettingsMsg::Set {
                            key,
                            value,
                            reply: inner,
                        },
                        ASK_TIMEOUT,
                    )
                    .await
                    .and_then(|r| r);
                let _ = reply.send(result);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::portfolio::{PortfolioSummary, Valuation};
    use crate::runtime::{SpawnOpts, spawn};
    use rust_decimal_macros::dec;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Portfolio stand-in with an adjustable valuation.
    struct StubPortfolio {
        value: Arc<Mutex<Decimal>>,
        cash: Arc<Mutex<Decimal>>,
    }

    #[async_trait]
    impl Actor for StubPortfolio {
        type Msg = PortfolioMsg;

        async fn handle(
            &mut self,
            msg: PortfolioMsg,
            _ctx: &ActorContext<PortfolioMsg>,
        ) -> Result<(), CoreError> {
            match msg {
                PortfolioMsg::Valuation { reply } => {
                    let value = *self.value.lock().unwrap();
                    let cash = *self.cash.lock().unwrap();
                    let _ = reply.send(Valuation {
                        portfolio_value: value,
                        available_cash: cash,
                        open_positions: 0,
                        gross_exposure: Decimal::ZERO,
                        realized_pnl: Decimal::ZERO,
                        unrealized_pnl: Decimal::ZERO,
                    });
                }
                PortfolioMsg::Summary { reply } => {
                    let value = *self.value.lock().unwrap();
                    let cash = *self.cash.lock().unwrap();
                    let _ = reply.send(PortfolioSummary {
                        exchange: "bybit".to_string(),
                        balances: Vec::new(),
                        positions: Vec::new(),
                        available_cash: cash,
                        portfolio_value: value,
                        realized_pnl: Decimal::ZERO,
                        unrealized_pnl: Decimal::ZERO,
                    });
                }
                _ => {}
            }
            Ok(())
        }
    }

    struct NullSettings;

    #[async_trait]
    impl Actor for NullSettings {
        type Msg = SettingsMsg;

        async fn handle(
            &mut self,
            msg: SettingsMsg,
            _ctx: &ActorContext<SettingsMsg>,
        ) -> Result<(), CoreError> {
            match msg {
                SettingsMsg::Get { reply, .. } => {
                    let _ = reply.send(Ok(None));
                }
                SettingsMsg::Set { reply, .. } => {
                    let _ = reply.send(Ok(()));
                }
            }
            Ok(())
        }
    }

    struct Fixture {
        gate: crate::runtime::Addr<RiskGateMsg>,
        value: Arc<Mutex<Decimal>>,
        #[allow(dead_code)]
        cash: Arc<Mutex<Decimal>>,
    }

    fn fixture(value: Decimal, cash: Decimal, config: RiskConfig) -> Fixture {
        let value = Arc::new(Mutex::new(value));
        let cash = Arc::new(Mutex::new(cash));
        let (portfolio, _h1) = spawn(
            "portfolio",
            StubPortfolio {
                value: value.clone(),
                cash: cash.clone(),
            },
            SpawnOpts::default(),
        );
        let (settings, _h2) = spawn("settings", NullSettings, SpawnOpts::default());
        let (gate, _h3) = spawn(
            "risk-gate",
            RiskGateActor::new("bybit".to_string(), config, settings, portfolio),
            SpawnOpts::default(),
        );
        // Leak the handles; the actors die with the test runtime.
        std::mem::forget(_h1);
        std::mem::forget(_h2);
        std::mem::forget(_h3);
        Fixture { gate, value, cash }
    }

    async fn validate(fixture: &Fixture, request: RiskRequest) -> Result<(), CoreError> {
        fixture
            .gate
            .ask(
                |reply| RiskGateMsg::Validate { request, reply },
                Duration::from_secs(5),
            )
            .await
            .unwrap()
    }

    fn buy(quantity: Decimal, price: Decimal) -> RiskRequest {
        RiskRequest {
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            quantity,
            price,
        }
    }

    #[tokio::test]
    async fn oversized_order_is_rejected_with_exact_message() {
        let fixture = fixture(dec!(100000), dec!(100000), RiskConfig::default());
        let err = validate(&fixture, buy(dec!(1), dec!(50000)))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Order value 50000.00 exceeds max position size limit 10000.00"
        );
    }

    #[tokio::test]
    async fn drawdown_lockout_until_recovery() {
        let fixture = fixture(dec!(100000), dec!(100000), RiskConfig::default());
        // Establish the high-water mark.
        validate(&fixture, buy(dec!(0.1), dec!(50000))).await.unwrap();

        // Portfolio drops 20%; max drawdown is 15%.
        *fixture.value.lock().unwrap() = dec!(80000);
        let err = validate(&fixture, buy(dec!(0.1), dec!(50000)))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Current drawdown 20.00% exceeds maximum allowed 15.00%"
        );

        // Recovery above high_water * 0.85 clears the lockout.
        *fixture.value.lock().unwrap() = dec!(86000);
        validate(&fixture, buy(dec!(0.1), dec!(50000))).await.unwrap();
    }

    #[tokio::test]
    async fn buys_require_available_cash() {
        let fixture = fixture(dec!(100000), dec!(1000), RiskConfig::default());
        let err = validate(&fixture, buy(dec!(0.1), dec!(50000)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("available cash"));

        // Sells are not cash-constrained.
        let sell = RiskRequest {
            side: OrderSide::Sell,
            ..buy(dec!(0.1), dec!(50000))
        };
        fixture
            .gate
            .ask(
                |reply| RiskGateMsg::Validate {
                    request: sell,
                    reply,
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn approvals_accumulate_into_daily_ledger() {
        let mut config = RiskConfig::default();
        config.max_daily_volume = dec!(0.10);
        let fixture = fixture(dec!(100000), dec!(100000), config);

        validate(&fixture, buy(dec!(0.1), dec!(50000))).await.unwrap();
        validate(&fixture, buy(dec!(0.1), dec!(50000))).await.unwrap();
        // Third 5k order would push volume to 15k > 10k.
        let err = validate(&fixture, buy(dec!(0.1), dec!(50000)))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Daily volume"));
    }

    #[test]
    fn midnight_reset_clears_risk_and_trims_volume() {
        let mut ledger = RiskLedger::default();
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let old = today - ChronoDuration::days(31);
        let recent = today - ChronoDuration::days(5);
        ledger.record_approval("BTCUSDT", dec!(5000), old);
        ledger.record_approval("BTCUSDT", dec!(2000), recent);
        ledger.record_approval("BTCUSDT", dec!(1000), today);
        assert_eq!(ledger.daily_risk_used(), dec!(8000));

        ledger.midnight_reset(today);
        assert_eq!(ledger.daily_risk_used(), Decimal::ZERO);
        assert_eq!(ledger.volume_for(old), Decimal::ZERO);
        assert_eq!(ledger.volume_for(recent), dec!(2000));
        assert_eq!(ledger.volume_for(today), dec!(1000));
    }

    #[test]
    fn ledger_history_agrees_with_daily_volume() {
        let mut ledger = RiskLedger::default();
        let today = Utc::now().date_naive();
        for _ in 0..5 {
            ledger.record_approval("BTCUSDT", dec!(100), today);
        }
        assert_eq!(ledger.volume_for(today), dec!(500));
        assert_eq!(ledger.history_value_for(today), dec!(500));
    }

    #[test]
    fn order_history_is_bounded() {
        let mut ledger = RiskLedger::default();
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        for _ in 0..1200 {
            ledger.record_approval("BTCUSDT", dec!(1), today);
        }
        assert_eq!(ledger.order_history_len(), ORDER_HISTORY_CAP);
    }
}
