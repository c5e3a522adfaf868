//! Optional scripted portfolio rebalancing.
//!
//! Hosts a second class of scripts exposing `on_rebalance(balances,
//! prices)`. Triggers arrive as mailbox messages, either from the interval
//! timer or from an explicit gateway request; the timer task never runs
//! script code itself. Target orders flow through the same risk gate and
//! order manager path as strategy signals.

use crate::application::order_manager::OrderManagerMsg;
use crate::application::portfolio::PortfolioMsg;
use crate::application::risk_gate::{RiskGateMsg, RiskRequest};
use crate::application::strategy::script::ScriptHost;
use crate::domain::errors::CoreError;
use crate::domain::order::OrderIntent;
use crate::runtime::{ASK_TIMEOUT, Actor, ActorContext, Addr};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq)]
pub struct RebalancerStatus {
    pub active: bool,
    pub script: Option<String>,
    pub interval_secs: u64,
    pub runs: u64,
    pub orders_submitted: u64,
}

pub enum RebalancerMsg {
    /// Coarse timer pulse; runs the script when the interval has elapsed.
    Tick,
    /// Explicit request: run the script now.
    Trigger,
    Start,
    Stop,
    LoadScript {
        name: String,
        source: String,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Status {
        reply: oneshot::Sender<RebalancerStatus>,
    },
}

pub struct RebalancerActor {
    exchange: String,
    host: Option<ScriptHost>,
    script_name: Option<String>,
    interval: Duration,
    last_run: Option<tokio::time::Instant>,
    active: bool,
    runs: u64,
    orders_submitted: u64,
    risk_gate: Addr<RiskGateMsg>,
    order_manager: Addr<OrderManagerMsg>,
    portfolio: Addr<PortfolioMsg>,
}

impl RebalancerActor {
    pub fn new(
        exchange: String,
        risk_gate: Addr<RiskGateMsg>,
        order_manager: Addr<OrderManagerMsg>,
        portfolio: Addr<PortfolioMsg>,
    ) -> Self {
        RebalancerActor {
            exchange,
            host: None,
            script_name: None,
            interval: DEFAULT_INTERVAL,
            last_run: None,
            active: false,
            runs: 0,
            orders_submitted: 0,
            risk_gate,
            order_manager,
            portfolio,
        }
    }

    async fn run_script(&mut self) {
        let Some(host) = self.host.as_mut() else {
            return;
        };
        let summary = match self
            .portfolio
            .ask(|reply| PortfolioMsg::Summary { reply }, ASK_TIMEOUT)
            .await
        {
            Ok(summary) => summary,
            Err(err) => {
                warn!(
                    component = "rebalancer",
                    exchange = %self.exchange,
                    err = %err,
                    "portfolio unavailable, skipping run"
                );
                return;
            }
        };
        host.set_balances(summary.balances.clone());
        let prices: BTreeMap<String, Decimal> = summary
            .positions
            .iter()
            .map(|p| (p.symbol.clone(), p.current_price))
            .collect();

        self.runs += 1;
        let intents = match host.on_rebalance(&prices) {
            Ok(intents) => intents,
            Err(err) => {
                warn!(
                    component = "rebalancer",
                    exchange = %self.exchange,
                    err = %err,
                    "rebalance script failed"
                );
                return;
            }
        };
        info!(
            component = "rebalancer",
            exchange = %self.exchange,
            intents = intents.len(),
            "rebalance produced target orders"
        );
        self.route_intents(intents, &prices).await;
    }

    async fn route_intents(
        &mut self,
        intents: Vec<OrderIntent>,
        prices: &BTreeMap<String, Decimal>,
    ) {
        for intent in intents {
            let price = intent
                .limit_price
                .or_else(|| prices.get(&intent.symbol).copied())
                .unwrap_or(Decimal::ZERO);
            if price <= Decimal::ZERO {
                warn!(
                    component = "rebalancer",
                    exchange = %self.exchange,
                    symbol = %intent.symbol,
                    "no reference price for target order, skipping"
                );
                continue;
            }
            let request = RiskRequest {
                symbol: intent.symbol.clone(),
                side: intent.side,
                quantity: intent.quantity,
                price,
            };
            let approved = self
                .risk_gate
                .ask(
                    |reply| RiskGateMsg::Validate { request, reply },
                    ASK_TIMEOUT,
                )
                .await;
            match approved {
                Ok(Ok(())) => {
                    let submitted = self
                        .order_manager
                        .ask(
                            |reply| OrderManagerMsg::Submit { intent, reply },
                            ASK_TIMEOUT,
                        )
                        .await;
                    match submitted {
                        Ok(Ok(_)) => self.orders_submitted += 1,
                        Ok(Err(err)) | Err(err) => {
                            warn!(
                                component = "rebalancer",
                                exchange = %self.exchange,
                                err = %err,
                                "target order submission failed"
                            );
                        }
                    }
                }
                Ok(Err(err)) => {
                    info!(
                        component = "rebalancer",
                        exchange = %self.exchange,
                        reason = %err,
                        "target order rejected by risk gate"
                    );
                }
                Err(err) => {
                    warn!(
                        component = "rebalancer",
                        exchange = %self.exchange,
                        err = %err,
                        "risk gate unavailable"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl Actor for RebalancerActor {
    type Msg = RebalancerMsg;

    /// The timer task only delivers pulses; script execution stays inside
    /// the mailbox, and the pulse rate is independent of the script's
    /// declared interval so a reload takes effect without rescheduling.
    async fn started(&mut self, ctx: &ActorContext<RebalancerMsg>) -> Result<(), CoreError> {
        let addr = ctx.addr();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;
                addr.tell(RebalancerMsg::Tick).await;
            }
        });
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: RebalancerMsg,
        _ctx: &ActorContext<RebalancerMsg>,
    ) -> Result<(), CoreError> {
        match msg {
            RebalancerMsg::Tick => {
                let due = self
                    .last_run
                    .map(|at| at.elapsed() >= self.interval)
                    .unwrap_or(true);
                if self.active && due {
                    self.last_run = Some(tokio::time::Instant::now());
                    self.run_script().await;
                }
                Ok(())
            }
            RebalancerMsg::Trigger => {
                if self.host.is_some() {
                    self.last_run = Some(tokio::time::Instant::now());
                    self.run_script().await;
                }
                Ok(())
            }
            RebalancerMsg::Start => {
                self.active = self.host.is_some();
                if !self.active {
                    warn!(
                        component = "rebalancer",
                        exchange = %self.exchange,
                        "cannot start without a loaded script"
                    );
                }
                Ok(())
            }
            RebalancerMsg::Stop => {
                self.active = false;
                Ok(())
            }
            RebalancerMsg::LoadScript { name, source, reply } => {
                let result = ScriptHost::load(&name, "", &source).and_then(|mut host| {
                    let settings = host.settings()?;
                    if let Some(secs) = settings
                        .params
                        .get("interval_secs")
                        .and_then(|raw| raw.parse::<u64>().ok())
                    {
                        self.interval = Duration::from_secs(secs.max(1));
                    }
                    Ok(host)
                });
                match result {
                    Ok(host) => {
                        info!(
                            component = "rebalancer",
                            exchange = %self.exchange,
                            script = %name,
                            "rebalance script loaded"
                        );
                        self.host = Some(host);
                        self.script_name = Some(name);
                        let _ = reply.send(Ok(()));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
                Ok(())
            }
            RebalancerMsg::Status { reply } => {
                let _ = reply.send(RebalancerStatus {
                    active: self.active,
                    script: self.script_name.clone(),
                    interval_secs: self.interval.as_secs(),
                    runs: self.runs,
                    orders_submitted: self.orders_submitted,
                });
                Ok(())
            }
        }
    }
}
