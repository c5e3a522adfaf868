//! Exchange session: one live connection to one venue.
//!
//! Owns the market stream, the subscription registry and the per-exchange
//! child tree (settings, portfolio, risk gate, order manager, strategies,
//! rebalancer). Decoded market events are fanned out over a broadcast
//! channel; per-subscriber relay tasks filter and forward into mailboxes,
//! so fan-out never blocks and a slow strategy loses its oldest market-data
//! messages rather than stalling the stream. Order updates and trades do
//! not travel on this lossy path.

use crate::application::order_manager::{OrderManagerActor, OrderManagerMsg};
use crate::application::portfolio::{PortfolioActor, PortfolioMsg, PortfolioSummary};
use crate::application::rebalancer::{RebalancerActor, RebalancerMsg, RebalancerStatus};
use crate::application::risk_gate::{RiskGateActor, RiskGateMsg, RiskMetrics, RiskRequest};
use crate::application::settings::{SettingsActor, SettingsMsg};
use crate::application::strategy::script::ScriptHost;
use crate::application::strategy::{StrategyActor, StrategyMsg, StrategyStatus};
use crate::config::{StrategiesConfig, VenueConfig};
use crate::domain::errors::CoreError;
use crate::domain::market::{Interval, MarketEvent};
use crate::domain::order::{Order, OrderIntent};
use crate::domain::portfolio::{Balance, Position};
use crate::domain::ports::ExchangeClient;
use crate::domain::repositories::{
    OrderRepository, SettingsRepository, SnapshotRepository, TradeRepository,
};
use crate::infrastructure::bybit::codec;
use crate::infrastructure::bybit::ws::{StreamCommand, StreamSignal, spawn_public_stream};
use crate::runtime::{
    ASK_TIMEOUT, Actor, ActorContext, Addr, ChildEvent, ChildSet, EXCHANGE_ASK_TIMEOUT, SpawnOpts,
    spawn,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Broadcast buffer per session; lagging subscribers lose the oldest
/// entries first.
const EVENT_BUS_CAPACITY: usize = 1024;
const ORDER_BOOK_DEPTH: u16 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribing,
    Streaming,
    Reconnecting,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Subscribing => "subscribing",
            SessionState::Streaming => "streaming",
            SessionState::Reconnecting => "reconnecting",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub venue: String,
    pub state: SessionState,
    pub kline_subscriptions: usize,
    pub book_subscriptions: usize,
    pub strategies: usize,
}

/// Rebalancer control surface re-exported through the session.
pub enum RebalanceControl {
    Status {
        reply: oneshot::Sender<RebalancerStatus>,
    },
    Start,
    Stop,
    Trigger,
    LoadScript {
        name: String,
        source: String,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
}

pub enum SessionMsg {
    Connect,
    SubscribeKlines {
        symbols: Vec<String>,
        interval: Interval,
    },
    SubscribeOrderBook {
        symbols: Vec<String>,
    },
    GetBalances {
        reply: oneshot::Sender<Result<Vec<Balance>, CoreError>>,
    },
    GetPositions {
        reply: oneshot::Sender<Result<Vec<Position>, CoreError>>,
    },
    PlaceOrder {
        intent: OrderIntent,
        reply: oneshot::Sender<Result<Order, CoreError>>,
    },
    CancelOrder {
        symbol: String,
        exchange_id: String,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },

    // Internal plumbing.
    Stream(StreamSignal),
    CredentialCheck {
        result: Result<(), CoreError>,
    },
    Child(ChildEvent),

    // Gateway contract.
    ListStrategies {
        reply: oneshot::Sender<Vec<StrategyStatus>>,
    },
    StartStrategy {
        symbol: String,
        script_name: String,
        source: String,
        reply: oneshot::Sender<Result<String, CoreError>>,
    },
    StopStrategy {
        id: String,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    StrategyLogs {
        id: String,
        reply: oneshot::Sender<Result<Vec<String>, CoreError>>,
    },
    RecentOrders {
        symbol: Option<String>,
        limit: u32,
        reply: oneshot::Sender<Result<Vec<Order>, CoreError>>,
    },
    RiskMetrics {
        reply: oneshot::Sender<Result<RiskMetrics, CoreError>>,
    },
    GetRiskParam {
        key: String,
        reply: oneshot::Sender<Result<Option<String>, CoreError>>,
    },
    SetRiskParam {
        key: String,
        value: String,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    PortfolioSummary {
        reply: oneshot::Sender<Result<PortfolioSummary, CoreError>>,
    },
    Rebalance(RebalanceControl),
}

/// Everything a session needs to build its child tree.
pub struct SessionDeps {
    pub client: Arc<dyn ExchangeClient>,
    pub orders_repo: Arc<dyn OrderRepository>,
    pub trades_repo: Arc<dyn TradeRepository>,
    pub settings_repo: Arc<dyn SettingsRepository>,
    pub snapshots_repo: Option<Arc<dyn SnapshotRepository>>,
    pub risk_config: crate::config::RiskConfig,
    /// `(script_name, source)` pairs started for every configured pair.
    pub scripts: Vec<(String, String)>,
    /// Public-stream websocket URL; `None` disables the stream (tests).
    pub ws_url: Option<String>,
}

struct StrategyEntry {
    addr: Addr<StrategyMsg>,
    relay: JoinHandle<()>,
}

pub struct SessionActor {
    venue: String,
    config: VenueConfig,
    strategies_config: StrategiesConfig,
    deps: SessionDeps,
    state: SessionState,
    events: broadcast::Sender<MarketEvent>,
    children: ChildSet,
    child_events_tx: Option<mpsc::Sender<ChildEvent>>,
    settings: Option<Addr<SettingsMsg>>,
    portfolio: Option<Addr<PortfolioMsg>>,
    risk_gate: Option<Addr<RiskGateMsg>>,
    order_manager: Option<Addr<OrderManagerMsg>>,
    rebalancer: Option<Addr<RebalancerMsg>>,
    strategies: HashMap<String, StrategyEntry>,
    stream_cmd: Option<mpsc::Sender<StreamCommand>>,
    stream_tasks: Vec<JoinHandle<()>>,
    relay_tasks: Vec<JoinHandle<()>>,
    kline_topics: HashSet<(String, Interval)>,
    book_topics: HashSet<String>,
    ticker_topics: HashSet<String>,
    /// index/last ratio per symbol; identity when sanity adjustment is off.
    price_ratio: HashMap<String, Decimal>,
    ever_streamed: bool,
}

impl SessionActor {
    pub fn new(venue: String, config: VenueConfig, strategies_config: StrategiesConfig, deps: SessionDeps) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        SessionActor {
            venue,
            config,
            strategies_config,
            deps,
            state: SessionState::Disconnected,
            events,
            children: ChildSet::new(),
            child_events_tx: None,
            settings: None,
            portfolio: None,
            risk_gate: None,
            order_manager: None,
            rebalancer: None,
            strategies: HashMap::new(),
            stream_cmd: None,
            stream_tasks: Vec::new(),
            relay_tasks: Vec::new(),
            kline_topics: HashSet::new(),
            book_topics: HashSet::new(),
            ticker_topics: HashSet::new(),
            price_ratio: HashMap::new(),
            ever_streamed: false,
        }
    }

    fn order_manager(&self) -> Result<&Addr<OrderManagerMsg>, CoreError> {
        self.order_manager
            .as_ref()
            .ok_or_else(|| CoreError::Config("session has no order manager".to_string()))
    }

    fn spawn_children(&mut self, ctx: &ActorContext<SessionMsg>) {
        let (events_tx, mut events_rx) = mpsc::channel::<ChildEvent>(32);
        let addr = ctx.addr();
        self.relay_tasks.push(tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                addr.tell(SessionMsg::Child(event)).await;
            }
        }));
        self.child_events_tx = Some(events_tx.clone());
        let opts = || SpawnOpts {
            events: Some(events_tx.clone()),
            ..Default::default()
        };

        let (settings, handle) = spawn(
            format!("{}/settings", self.venue),
            SettingsActor::new(self.venue.clone(), self.deps.settings_repo.clone()),
            opts(),
        );
        self.children.add(handle);

        let (portfolio, handle) = spawn(
            format!("{}/portfolio", self.venue),
            PortfolioActor::new(
                self.venue.clone(),
                self.deps.client.clone(),
                self.deps.snapshots_repo.clone(),
            ),
            opts(),
        );
        self.children.add(handle);

        let (risk_gate, handle) = spawn(
            format!("{}/risk-gate", self.venue),
            RiskGateActor::new(
                self.venue.clone(),
                self.deps.risk_config.clone(),
                settings.clone(),
                portfolio.clone(),
            ),
            opts(),
        );
        self.children.add(handle);

        let (order_manager, handle) = spawn(
            format!("{}/order-manager", self.venue),
            OrderManagerActor::new(
                self.venue.clone(),
                self.deps.client.clone(),
                self.deps.orders_repo.clone(),
                self.deps.trades_repo.clone(),
                portfolio.clone(),
            ),
            opts(),
        );
        self.children.add(handle);

        let (rebalancer, handle) = spawn(
            format!("{}/rebalancer", self.venue),
            RebalancerActor::new(
                self.venue.clone(),
                risk_gate.clone(),
                order_manager.clone(),
                portfolio.clone(),
            ),
            opts(),
        );
        self.children.add(handle);

        // Price relay: closes, ticks and mid-prices drive trigger
        // evaluation and mark-to-market.
        let mut price_rx = self.events.subscribe();
        let order_manager_addr = order_manager.clone();
        let portfolio_addr = portfolio.clone();
        self.relay_tasks.push(tokio::spawn(async move {
            loop {
                match price_rx.recv().await {
                    Ok(event) => {
                        let (symbol, price) = match &event {
                            MarketEvent::Kline(k) if k.closed => (k.symbol.clone(), k.close),
                            MarketEvent::Kline(_) => continue,
                            MarketEvent::Ticker(t) => (t.symbol.clone(), t.price),
                            MarketEvent::OrderBook(b) => match b.mid_price() {
                                Some(mid) => (b.symbol.clone(), mid),
                                None => continue,
                            },
                        };
                        order_manager_addr
                            .tell(OrderManagerMsg::PriceUpdate {
                                symbol: symbol.clone(),
                                price,
                            })
                            .await;
                        portfolio_addr
                            .tell(PortfolioMsg::PriceUpdate { symbol, price })
                            .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(component = "session", dropped = n, "price relay lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        self.settings = Some(settings);
        self.portfolio = Some(portfolio);
        self.risk_gate = Some(risk_gate);
        self.order_manager = Some(order_manager);
        self.rebalancer = Some(rebalancer);
    }

    fn start_strategy(
        &mut self,
        symbol: &str,
        script_name: &str,
        source: &str,
    ) -> Result<String, CoreError> {
        let id = StrategyActor::id(&self.venue, symbol, script_name);
        if let Some(existing) = self.strategies.get(&id) {
            // Idempotent: starting a running strategy reactivates it.
            let addr = existing.addr.clone();
            tokio::spawn(async move { addr.tell(StrategyMsg::SetActive(true)).await });
            return Ok(id);
        }

        let mut host = ScriptHost::load(script_name, symbol, source)?;
        let settings = host.settings()?;
        let interval = match settings.interval.as_deref() {
            Some(raw) => raw.parse::<Interval>()?,
            None => self.strategies_config.default_interval()?,
        };

        let wants_books = host.has_on_orderbook();
        let wants_ticker = host.has_on_ticker();
        let actor = StrategyActor::new(
            self.venue.clone(),
            symbol.to_string(),
            script_name.to_string(),
            interval,
            host,
            self.strategies_config.window,
            self.risk_gate
                .clone()
                .ok_or_else(|| CoreError::Config("session not started".to_string()))?,
            self.order_manager
                .clone()
                .ok_or_else(|| CoreError::Config("session not started".to_string()))?,
            self.portfolio
                .clone()
                .ok_or_else(|| CoreError::Config("session not started".to_string()))?,
        );
        let (addr, handle) = spawn(
            format!("{}/strategy/{}", self.venue, id),
            actor,
            SpawnOpts {
                events: self.child_events_tx.clone(),
                ..Default::default()
            },
        );
        self.children.add(handle);

        // Filtered relay from the event bus into this strategy's mailbox.
        let mut rx = self.events.subscribe();
        let strategy = addr.clone();
        let relay_symbol = symbol.to_string();
        let relay_id = id.clone();
        let relay = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(MarketEvent::Kline(k))
                        if k.symbol == relay_symbol && k.interval == interval =>
                    {
                        strategy.tell(StrategyMsg::Kline(k)).await;
                    }
                    Ok(MarketEvent::OrderBook(b)) if wants_books && b.symbol == relay_symbol => {
                        strategy.tell(StrategyMsg::OrderBook(b)).await;
                    }
                    Ok(MarketEvent::Ticker(t)) if wants_ticker && t.symbol == relay_symbol => {
                        strategy.tell(StrategyMsg::Ticker(t)).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(
                            component = "session",
                            strategy = %relay_id,
                            dropped = n,
                            "strategy fell behind, oldest market data dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.strategies.insert(
            id.clone(),
            StrategyEntry { addr, relay },
        );

        self.register_klines(std::slice::from_ref(&symbol.to_string()), interval);
        if wants_books {
            self.register_books(std::slice::from_ref(&symbol.to_string()));
        }
        if wants_ticker || self.config.price_sanity_adjustment {
            self.register_tickers(std::slice::from_ref(&symbol.to_string()));
        }

        // Warm the rolling window from kline history; never persisted, so
        // it is refetched on every start.
        let client = self.deps.client.clone();
        let strategy = self.strategies[&id].addr.clone();
        let backfill_symbol = symbol.to_string();
        let window = self.strategies_config.window as u32;
        tokio::spawn(async move {
            match client.klines(&backfill_symbol, interval, window).await {
                Ok(klines) => strategy.tell(StrategyMsg::Backfill(klines)).await,
                Err(err) => {
                    warn!(
                        component = "session",
                        symbol = %backfill_symbol,
                        err = %err,
                        "kline backfill failed"
                    );
                }
            }
        });
        info!(
            component = "session",
            exchange = %self.venue,
            strategy = %id,
            interval = %interval,
            "strategy started"
        );
        Ok(id)
    }

    fn register_klines(&mut self, symbols: &[String], interval: Interval) {
        let mut fresh = Vec::new();
        for symbol in symbols {
            if self.kline_topics.insert((symbol.clone(), interval)) {
                fresh.push(codec::kline_topic(symbol, interval));
            }
        }
        self.send_subscribe(fresh);
    }

    fn register_books(&mut self, symbols: &[String]) {
        let mut fresh = Vec::new();
        for symbol in symbols {
            if self.book_topics.insert(symbol.clone()) {
                fresh.push(codec::orderbook_topic(symbol, ORDER_BOOK_DEPTH));
            }
        }
        self.send_subscribe(fresh);
    }

    fn register_tickers(&mut self, symbols: &[String]) {
        let mut fresh = Vec::new();
        for symbol in symbols {
            if self.ticker_topics.insert(symbol.clone()) {
                fresh.push(codec::ticker_topic(symbol));
            }
        }
        self.send_subscribe(fresh);
    }

    fn send_subscribe(&self, topics: Vec<String>) {
        if topics.is_empty() {
            return;
        }
        if let Some(cmd) = &self.stream_cmd {
            let cmd = cmd.clone();
            tokio::spawn(async move {
                let _ = cmd.send(StreamCommand::Subscribe(topics)).await;
            });
        }
    }

    fn handle_stream_event(&mut self, event: MarketEvent) {
        if self.state == SessionState::Subscribing {
            self.state = SessionState::Streaming;
        }
        match event {
            MarketEvent::Kline(kline) => {
                let kline = match self.price_ratio.get(&kline.symbol) {
                    Some(ratio) if self.config.price_sanity_adjustment => kline.scaled(*ratio),
                    _ => kline,
                };
                let _ = self.events.send(MarketEvent::Kline(kline));
            }
            MarketEvent::OrderBook(book) => {
                if book.is_empty() {
                    warn!(
                        component = "session",
                        exchange = %self.venue,
                        symbol = %book.symbol,
                        "dropping empty order book"
                    );
                    return;
                }
                if book.bids.is_empty() || book.asks.is_empty() {
                    debug!(
                        component = "session",
                        exchange = %self.venue,
                        symbol = %book.symbol,
                        "one-sided order book forwarded"
                    );
                }
                let _ = self.events.send(MarketEvent::OrderBook(book));
            }
            MarketEvent::Ticker(ticker) => {
                if self.config.price_sanity_adjustment
                    && let Some(index) = ticker.index_price
                    && ticker.price > Decimal::ZERO
                {
                    self.price_ratio
                        .insert(ticker.symbol.clone(), index / ticker.price);
                }
                let _ = self.events.send(MarketEvent::Ticker(ticker));
            }
        }
    }

    fn strategy_addr(&self, id: &str) -> Result<Addr<StrategyMsg>, CoreError> {
        self.strategies
            .get(id)
            .map(|e| e.addr.clone())
            .ok_or_else(|| CoreError::Validation(format!("no strategy with id '{}'", id)))
    }
}

#[async_trait]
impl Actor for SessionActor {
    type Msg = SessionMsg;

    async fn started(&mut self, ctx: &ActorContext<SessionMsg>) -> Result<(), CoreError> {
        self.spawn_children(ctx);

        // One strategy instance per (configured pair, loaded script).
        let pairs = self.config.pairs.clone();
        let scripts = self.deps.scripts.clone();
        let cap = self.strategies_config.max_concurrent as usize;
        'outer: for (script_name, source) in &scripts {
            for pair in &pairs {
                if self.strategies.len() >= cap {
                    warn!(
                        component = "session",
                        exchange = %self.venue,
                        cap,
                        "max concurrent strategies reached"
                    );
                    break 'outer;
                }
                if let Err(err) = self.start_strategy(pair, script_name, source) {
                    warn!(
                        component = "session",
                        exchange = %self.venue,
                        strategy = %script_name,
                        symbol = %pair,
                        err = %err,
                        "failed to start strategy"
                    );
                }
            }
        }

        ctx.addr().tell(SessionMsg::Connect).await;
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: SessionMsg,
        ctx: &ActorContext<SessionMsg>,
    ) -> Result<(), CoreError> {
        match msg {
            SessionMsg::Connect => {
                if self.state != SessionState::Disconnected {
                    debug!(component = "session", exchange = %self.venue, "already connecting");
                    return Ok(());
                }
                self.state = SessionState::Connecting;

                // Credential probe runs off-mailbox and reports back.
                let client = self.deps.client.clone();
                let addr = ctx.addr();
                tokio::spawn(async move {
                    let result = client.validate_credentials().await;
                    addr.tell(SessionMsg::CredentialCheck { result }).await;
                });

                if let Some(ws_url) = self.deps.ws_url.clone() {
                    let (cmd_tx, cmd_rx) = mpsc::channel(32);
                    let (signal_tx, mut signal_rx) = mpsc::channel(256);
                    self.stream_tasks
                        .push(spawn_public_stream(ws_url, cmd_rx, signal_tx));
                    let addr = ctx.addr();
                    self.relay_tasks.push(tokio::spawn(async move {
                        while let Some(signal) = signal_rx.recv().await {
                            addr.tell(SessionMsg::Stream(signal)).await;
                        }
                    }));
                    self.stream_cmd = Some(cmd_tx);

                    // Replay the registered topic set.
                    let mut topics: Vec<String> = self
                        .kline_topics
                        .iter()
                        .map(|(s, i)| codec::kline_topic(s, *i))
                        .collect();
                    topics.extend(self.book_topics.iter().map(|s| codec::orderbook_topic(s, ORDER_BOOK_DEPTH)));
                    topics.extend(self.ticker_topics.iter().map(|s| codec::ticker_topic(s)));
                    self.send_subscribe(topics);
                }
                Ok(())
            }
            SessionMsg::CredentialCheck { result } => match result {
                Ok(()) => {
                    info!(component = "session", exchange = %self.venue, "credentials validated");
                    if self.state == SessionState::Connecting {
                        self.state = SessionState::Connected;
                    }
                    Ok(())
                }
                Err(CoreError::Auth(reason)) => {
                    // Fatal for this session; the supervisor alerts and
                    // leaves it stopped.
                    Err(CoreError::Auth(reason))
                }
                Err(err) => {
                    warn!(
                        component = "session",
                        exchange = %self.venue,
                        err = %err,
                        "credential probe failed, will retry with the stream"
                    );
                    Ok(())
                }
            },
            SessionMsg::Stream(signal) => {
                match signal {
                    StreamSignal::Connected => {
                        let reconnect = self.ever_streamed;
                        self.state = SessionState::Subscribing;
                        if reconnect {
                            info!(
                                component = "session",
                                exchange = %self.venue,
                                "stream reconnected, reconciling orders"
                            );
                            self.order_manager()?.tell(OrderManagerMsg::Reconcile).await;
                        }
                        self.ever_streamed = true;
                    }
                    StreamSignal::Disconnected { reason } => {
                        warn!(
                            component = "session",
                            exchange = %self.venue,
                            reason = %reason,
                            "stream disconnected"
                        );
                        self.state = SessionState::Reconnecting;
                    }
                    StreamSignal::Event(event) => self.handle_stream_event(event),
                }
                Ok(())
            }
            SessionMsg::SubscribeKlines { symbols, interval } => {
                self.register_klines(&symbols, interval);
                Ok(())
            }
            SessionMsg::SubscribeOrderBook { symbols } => {
                self.register_books(&symbols);
                Ok(())
            }
            SessionMsg::GetBalances { reply } => {
                let client = self.deps.client.clone();
                tokio::spawn(async move {
                    let _ = reply.send(client.balances().await);
                });
                Ok(())
            }
            SessionMsg::GetPositions { reply } => {
                let client = self.deps.client.clone();
                tokio::spawn(async move {
                    let _ = reply.send(client.positions().await);
                });
                Ok(())
            }
            SessionMsg::PlaceOrder { intent, reply } => {
                // Gateway orders pass the same risk gate as strategy
                // signals.
                let Some(risk_gate) = self.risk_gate.clone() else {
                    let _ = reply.send(Err(CoreError::Config("session not started".to_string())));
                    return Ok(());
                };
                let order_manager = self.order_manager()?.clone();
                let last_price = intent.limit_price.unwrap_or(Decimal::ZERO);
                tokio::spawn(async move {
                    let request = RiskRequest {
                        symbol: intent.symbol.clone(),
                        side: intent.side,
                        quantity: intent.quantity,
                        price: last_price,
                    };
                    let verdict = risk_gate
                        .ask(
                            |inner| RiskGateMsg::Validate {
                                request,
                                reply: inner,
                            },
                            ASK_TIMEOUT,
                        )
                        .await
                        .and_then(|r| r);
                    match verdict {
                        Ok(()) => {
                            let result = order_manager
                                .ask(
                                    |inner| OrderManagerMsg::Submit {
                                        intent,
                                        reply: inner,
                                    },
                                    EXCHANGE_ASK_TIMEOUT,
                                )
                                .await
                                .and_then(|r| r);
                            let _ = reply.send(result);
                        }
                        Err(err) => {
                            let _ = reply.send(Err(err));
                        }
                    }
                });
                Ok(())
            }
            SessionMsg::CancelOrder {
                symbol,
                exchange_id,
                reply,
            } => {
                let order_manager = self.order_manager()?.clone();
                tokio::spawn(async move {
                    let open = order_manager
                        .ask(|inner| OrderManagerMsg::OpenOrders { reply: inner }, ASK_TIMEOUT)
                        .await
                        .unwrap_or_default();
                    let target = open.iter().find(|o| {
                        o.symbol == symbol && o.exchange_id.as_deref() == Some(exchange_id.as_str())
                    });
                    match target {
                        Some(order) => {
                            let local_id = order.local_id;
                            let result = order_manager
                                .ask(
                                    |inner| OrderManagerMsg::Cancel {
                                        local_id,
                                        reply: inner,
                                    },
                                    EXCHANGE_ASK_TIMEOUT,
                                )
                                .await
                                .and_then(|r| r);
                            let _ = reply.send(result);
                        }
                        None => {
                            let _ = reply.send(Err(CoreError::Validation(format!(
                                "no open order {} on {}",
                                exchange_id, symbol
                            ))));
                        }
                    }
                });
                Ok(())
            }
            SessionMsg::Status { reply } => {
                let _ = reply.send(SessionStatus {
                    venue: self.venue.clone(),
                    state: self.state,
                    kline_subscriptions: self.kline_topics.len(),
                    book_subscriptions: self.book_topics.len(),
                    strategies: self.strategies.len(),
                });
                Ok(())
            }
            SessionMsg::Child(event) => {
                match event {
                    ChildEvent::Failed { name, error } => {
                        // Default policy: log, do not restart.
                        warn!(
                            component = "session",
                            exchange = %self.venue,
                            child = %name,
                            err = %error,
                            "child component failed"
                        );
                    }
                    ChildEvent::Stopped { name } => {
                        debug!(component = "session", child = %name, "child stopped");
                    }
                }
                Ok(())
            }
            SessionMsg::ListStrategies { reply } => {
                let mut statuses = Vec::with_capacity(self.strategies.len());
                for entry in self.strategies.values() {
                    if let Ok(status) = entry
                        .addr
                        .ask(|inner| StrategyMsg::Status { reply: inner }, ASK_TIMEOUT)
                        .await
                    {
                        statuses.push(status);
                    }
                }
                statuses.sort_by(|a, b| a.id.cmp(&b.id));
                let _ = reply.send(statuses);
                Ok(())
            }
            SessionMsg::StartStrategy {
                symbol,
                script_name,
                source,
                reply,
            } => {
                let _ = reply.send(self.start_strategy(&symbol, &script_name, &source));
                Ok(())
            }
            SessionMsg::StopStrategy { id, reply } => {
                let result = match self.strategy_addr(&id) {
                    Ok(addr) => {
                        addr.tell(StrategyMsg::SetActive(false)).await;
                        Ok(())
                    }
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
                Ok(())
            }
            SessionMsg::StrategyLogs { id, reply } => {
                let result = match self.strategy_addr(&id) {
                    Ok(addr) => {
                        addr.ask(|inner| StrategyMsg::Logs { reply: inner }, ASK_TIMEOUT)
                            .await
                    }
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
                Ok(())
            }
            SessionMsg::RecentOrders {
                symbol,
                limit,
                reply,
            } => {
                let result = self
                    .order_manager()?
                    .ask(
                        |inner| OrderManagerMsg::RecentOrders {
                            symbol,
                            limit,
                            reply: inner,
                        },
                        ASK_TIMEOUT,
                    )
                    .await
                    .and_then(|r| r);
                let _ = reply.send(result);
                Ok(())
            }
            SessionMsg::RiskMetrics { reply } => {
                let result = match &self.risk_gate {
                    Some(gate) => {
                        gate.ask(|inner| RiskGateMsg::Metrics { reply: inner }, ASK_TIMEOUT)
                            .await
                            .and_then(|r| r)
                    }
                    None => Err(CoreError::Config("session not started".to_string())),
                };
                let _ = reply.send(result);
                Ok(())
            }
            SessionMsg::GetRiskParam { key, reply } => {
                let result = match &self.risk_gate {
                    Some(gate) => {
                        gate.ask(
                            |inner| RiskGateMsg::GetParam { key, reply: inner },
                            ASK_TIMEOUT,
                        )
                        .await
                        .and_then(|r| r)
                    }
                    None => Err(CoreError::Config("session not started".to_string())),
                };
                let _ = reply.send(result);
                Ok(())
            }
            SessionMsg::SetRiskParam { key, value, reply } => {
                let result = match &self.risk_gate {
                    Some(gate) => {
                        gate.ask(
                            |inner| RiskGateMsg::SetParam {
                                key,
                                value,
                                reply: inner,
                            },
                            ASK_TIMEOUT,
                        )
                        .await
                        .and_then(|r| r)
                    }
                    None => Err(CoreError::Config("session not started".to_string())),
                };
                let _ = reply.send(result);
                Ok(())
            }
            SessionMsg::PortfolioSummary { reply } => {
                let result = match &self.portfolio {
                    Some(portfolio) => {
                        portfolio
                            .ask(|inner| PortfolioMsg::Summary { reply: inner }, ASK_TIMEOUT)
                            .await
                    }
                    None => Err(CoreError::Config("session not started".to_string())),
                };
                let _ = reply.send(result);
                Ok(())
            }
            SessionMsg::Rebalance(control) => {
                let Some(rebalancer) = &self.rebalancer else {
                    return Ok(());
                };
                match control {
                    RebalanceControl::Status { reply } => {
                        if let Ok(status) = rebalancer
                            .ask(|inner| RebalancerMsg::Status { reply: inner }, ASK_TIMEOUT)
                            .await
                        {
                            let _ = reply.send(status);
                        }
                    }
                    RebalanceControl::Start => rebalancer.tell(RebalancerMsg::Start).await,
                    RebalanceControl::Stop => rebalancer.tell(RebalancerMsg::Stop).await,
                    RebalanceControl::Trigger => rebalancer.tell(RebalancerMsg::Trigger).await,
                    RebalanceControl::LoadScript { name, source, reply } => {
                        let forwarded = rebalancer
                            .ask(
                                |inner| RebalancerMsg::LoadScript {
                                    name,
                                    source,
                                    reply: inner,
                                },
                                ASK_TIMEOUT,
                            )
                            .await
                            .and_then(|r| r);
                        let _ = reply.send(forwarded);
                    }
                }
                Ok(())
            }
        }
    }

    /// Children stop post-order, then the stream and relay tasks go down.
    async fn stopped(&mut self) {
        if let Some(cmd) = &self.stream_cmd {
            let _ = cmd.send(StreamCommand::Shutdown).await;
        }
        self.children.shutdown().await;
        for entry in self.strategies.values() {
            entry.relay.abort();
        }
        for task in &self.relay_tasks {
            task.abort();
        }
        for task in &self.stream_tasks {
            task.abort();
        }
        info!(component = "session", exchange = %self.venue, "session stopped");
    }

    /// Rejected credentials stop the whole session.
    fn is_fatal(&self, err: &CoreError) -> bool {
        err.is_fatal() || matches!(err, CoreError::Auth(_))
    }
}
