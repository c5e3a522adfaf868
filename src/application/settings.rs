//! Per-exchange key–value settings component.
//!
//! Deliberately uncached: every read goes to storage, so concurrent
//! writers (gateway, risk gate) always observe last-write-wins order.

use crate::domain::errors::CoreError;
use crate::domain::repositories::SettingsRepository;
use crate::runtime::{Actor, ActorContext};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::oneshot;

pub enum SettingsMsg {
    Get {
        key: String,
        reply: oneshot::Sender<Result<Option<String>, CoreError>>,
    },
    Set {
        key: String,
        value: String,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
}

pub struct SettingsActor {
    exchange: String,
    repository: Arc<dyn SettingsRepository>,
}

impl SettingsActor {
    pub fn new(exchange: String, repository: Arc<dyn SettingsRepository>) -> Self {
        SettingsActor {
            exchange,
            repository,
        }
    }
}

#[async_trait]
impl Actor for SettingsActor {
    type Msg = SettingsMsg;

    async fn handle(
        &mut self,
        msg: SettingsMsg,
        _ctx: &ActorContext<SettingsMsg>,
    ) -> Result<(), CoreError> {
        match msg {
            SettingsMsg::Get { key, reply } => {
                let result = self.repository.get(&self.exchange, &key).await;
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
            SettingsMsg::Set { key, value, reply } => {
                let result = self.repository.set(&self.exchange, &key, &value).await;
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
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::Database;
    use crate::infrastructure::persistence::repositories::SqliteSettingsRepository;
    use crate::runtime::{ASK_TIMEOUT, SpawnOpts, spawn};
    use std::time::Duration;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let db = Database::open_in_memory().await.unwrap();
        let repository = Arc::new(SqliteSettingsRepository::new(db));
        let (addr, handle) = spawn(
            "settings",
            SettingsActor::new("bybit".to_string(), repository),
            SpawnOpts::default(),
        );

        let missing = addr
            .ask(
                |reply| SettingsMsg::Get {
                    key: "max_drawdown".to_string(),
                    reply,
                },
                ASK_TIMEOUT,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(missing, None);

        addr.ask(
            |reply| SettingsMsg::Set {
                key: "max_drawdown".to_string(),
                value: "0.12".to_string(),
                reply,
            },
            ASK_TIMEOUT,
        )
        .await
        .unwrap()
        .unwrap();

        let value = addr
            .ask(
                |reply| SettingsMsg::Get {
                    key: "max_drawdown".to_string(),
                    reply,
                },
                ASK_TIMEOUT,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value.as_deref(), Some("0.12"));

        handle.stop(Duration::from_secs(1)).await;
    }
}
