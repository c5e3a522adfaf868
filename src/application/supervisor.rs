//! Root of the component tree: one exchange session per enabled venue.
//!
//! Failed sessions restart with exponential backoff unless they died on
//! rejected credentials, which only an operator can fix. Shutdown is
//! tree-ordered: sessions stop first (each stopping its own children
//! post-order), then the supervisor itself.

use crate::application::session::{SessionActor, SessionDeps, SessionMsg, SessionStatus};
use crate::config::{Config, VenueConfig};
use crate::domain::errors::CoreError;
use crate::domain::ports::ExchangeClient;
use crate::domain::repositories::{
    OrderRepository, SettingsRepository, SnapshotRepository, TradeRepository,
};
use crate::infrastructure::bybit::BybitClient;
use crate::runtime::{ASK_TIMEOUT, Actor, ActorContext, Addr, ChildEvent, ChildSet, SpawnOpts, spawn};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

const RESTART_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(60);

pub enum SupervisorMsg {
    Child(ChildEvent),
    RestartSession { venue: String },
    ListExchanges {
        reply: oneshot::Sender<Vec<SessionStatus>>,
    },
    /// Resolve a venue's session address for direct gateway asks.
    Session {
        venue: String,
        reply: oneshot::Sender<Option<Addr<SessionMsg>>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Storage handles shared by every session.
#[derive(Clone)]
pub struct Repositories {
    pub orders: Arc<dyn OrderRepository>,
    pub trades: Arc<dyn TradeRepository>,
    pub settings: Arc<dyn SettingsRepository>,
    pub snapshots: Option<Arc<dyn SnapshotRepository>>,
}

pub struct SupervisorActor {
    config: Config,
    repositories: Repositories,
    /// `(script_name, source)` pairs loaded from the strategy directory.
    scripts: Vec<(String, String)>,
    sessions: HashMap<String, Addr<SessionMsg>>,
    children: ChildSet,
    child_events_tx: Option<mpsc::Sender<ChildEvent>>,
    backoff: HashMap<String, Duration>,
    shutting_down: bool,
}

impl SupervisorActor {
    pub fn new(config: Config, repositories: Repositories, scripts: Vec<(String, String)>) -> Self {
        SupervisorActor {
            config,
            repositories,
            scripts,
            sessions: HashMap::new(),
            children: ChildSet::new(),
            child_events_tx: None,
            backoff: HashMap::new(),
            shutting_down: false,
        }
    }

    fn build_client(venue: &str, config: &VenueConfig) -> Result<Arc<dyn ExchangeClient>, CoreError> {
        match venue {
            "bybit" => Ok(Arc::new(BybitClient::new(
                config.api_key.clone(),
                config.api_secret.clone(),
                config.testnet,
                config.rest_rate_per_sec,
            ))),
            other => Err(CoreError::Config(format!(
                "no exchange adapter for venue '{}'",
                other
            ))),
        }
    }

    fn session_child_name(venue: &str) -> String {
        format!("session/{}", venue)
    }

    fn spawn_session(&mut self, venue: &str) -> Result<(), CoreError> {
        let venue_config = self
            .config
            .exchanges
            .get(venue)
            .ok_or_else(|| CoreError::Config(format!("venue '{}' not configured", venue)))?
            .clone();
        let client = Self::build_client(venue, &venue_config)?;
        let ws_url = Some(BybitClient::ws_url(venue_config.testnet).to_string());
        let deps = SessionDeps {
            client,
            orders_repo: self.repositories.orders.clone(),
            trades_repo: self.repositories.trades.clone(),
            settings_repo: self.repositories.settings.clone(),
            snapshots_repo: self.repositories.snapshots.clone(),
            risk_config: self.config.risk.clone(),
            scripts: self.scripts.clone(),
            ws_url,
        };
        let actor = SessionActor::new(
            venue.to_string(),
            venue_config,
            self.config.strategies.clone(),
            deps,
        );
        let (addr, handle) = spawn(
            Self::session_child_name(venue),
            actor,
            SpawnOpts {
                events: self.child_events_tx.clone(),
                ..Default::default()
            },
        );
        self.children.add(handle);
        self.sessions.insert(venue.to_string(), addr);
        info!(component = "supervisor", exchange = venue, "exchange session spawned");
        Ok(())
    }

    fn schedule_restart(&mut self, ctx: &ActorContext<SupervisorMsg>, venue: String) {
        let delay = self
            .backoff
            .get(&venue)
            .copied()
            .unwrap_or(RESTART_BACKOFF_INITIAL);
        self.backoff
            .insert(venue.clone(), (delay * 2).min(RESTART_BACKOFF_CAP));
        warn!(
            component = "supervisor",
            exchange = %venue,
            delay_secs = delay.as_secs(),
            "scheduling session restart"
        );
        let addr = ctx.addr();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            addr.tell(SupervisorMsg::RestartSession { venue }).await;
        });
    }
}

#[async_trait]
impl Actor for SupervisorActor {
    type Msg = SupervisorMsg;

    async fn started(&mut self, ctx: &ActorContext<SupervisorMsg>) -> Result<(), CoreError> {
        let (events_tx, mut events_rx) = mpsc::channel::<ChildEvent>(32);
        self.child_events_tx = Some(events_tx);
        let addr = ctx.addr();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                addr.tell(SupervisorMsg::Child(event)).await;
            }
        });

        let venues: Vec<String> = self
            .config
            .enabled_exchanges()
            .map(|(venue, _)| venue.clone())
            .collect();
        if venues.is_empty() {
            warn!(component = "supervisor", "no exchanges enabled");
        }
        for venue in venues {
            self.spawn_session(&venue)?;
        }
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: SupervisorMsg,
        ctx: &ActorContext<SupervisorMsg>,
    ) -> Result<(), CoreError> {
        match msg {
            SupervisorMsg::Child(ChildEvent::Failed { name, error }) => {
                if self.shutting_down {
                    return Ok(());
                }
                let Some(venue) = name.strip_prefix("session/").map(String::from) else {
                    warn!(component = "supervisor", child = %name, err = %error, "child failed");
                    return Ok(());
                };
                self.sessions.remove(&venue);
                self.children.forget(&name);
                if matches!(error, CoreError::Auth(_)) {
                    error!(
                        component = "supervisor",
                        exchange = %venue,
                        err = %error,
                        "session stopped on rejected credentials, not restarting"
                    );
                } else {
                    error!(
                        component = "supervisor",
                        exchange = %venue,
                        err = %error,
                        "session failed"
                    );
                    self.schedule_restart(ctx, venue);
                }
                Ok(())
            }
            SupervisorMsg::Child(ChildEvent::Stopped { name }) => {
                debug!(component = "supervisor", child = %name, "child stopped");
                Ok(())
            }
            SupervisorMsg::RestartSession { venue } => {
                if self.shutting_down || self.sessions.contains_key(&venue) {
                    return Ok(());
                }
                if let Err(err) = self.spawn_session(&venue) {
                    error!(
                        component = "supervisor",
                        exchange = %venue,
                        err = %err,
                        "session restart failed"
                    );
                    self.schedule_restart(ctx, venue);
                }
                Ok(())
            }
            SupervisorMsg::ListExchanges { reply } => {
                let mut statuses = Vec::with_capacity(self.sessions.len());
                for session in self.sessions.values() {
                    if let Ok(status) = session
                        .ask(|inner| SessionMsg::Status { reply: inner }, ASK_TIMEOUT)
                        .await
                    {
                        statuses.push(status);
                    }
                }
                statuses.sort_by(|a, b| a.venue.cmp(&b.venue));
                let _ = reply.send(statuses);
                Ok(())
            }
            SupervisorMsg::Session { venue, reply } => {
                let _ = reply.send(self.sessions.get(&venue).cloned());
                Ok(())
            }
            SupervisorMsg::Shutdown { reply } => {
                info!(component = "supervisor", "shutting down");
                self.shutting_down = true;
                self.children.shutdown().await;
                self.sessions.clear();
                let _ = reply.send(());
                Ok(())
            }
        }
    }

    async fn stopped(&mut self) {
        if !self.shutting_down {
            self.children.shutdown().await;
        }
    }
}
