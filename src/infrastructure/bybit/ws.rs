//! Public market-data stream.
//!
//! One task owns the socket for its whole life: it connects, replays the
//! current topic set, pumps decoded events out as [`StreamSignal`]s and
//! reconnects with jittered exponential backoff after any read error.
//! Subscriptions are idempotent; the topic set survives reconnects.

use crate::domain::market::MarketEvent;
use crate::infrastructure::bybit::codec;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug)]
pub enum StreamCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Shutdown,
}

#[derive(Debug)]
pub enum StreamSignal {
    /// Socket is up and the topic set has been (re)played.
    Connected,
    Disconnected { reason: String },
    Event(MarketEvent),
}

pub fn spawn_public_stream(
    ws_url: String,
    command_rx: mpsc::Receiver<StreamCommand>,
    signal_tx: mpsc::Sender<StreamSignal>,
) -> JoinHandle<()> {
    tokio::spawn(run(ws_url, command_rx, signal_tx))
}

async fn run(
    ws_url: String,
    mut command_rx: mpsc::Receiver<StreamCommand>,
    signal_tx: mpsc::Sender<StreamSignal>,
) {
    let mut topics: BTreeSet<String> = BTreeSet::new();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        // Wait for at least one topic before dialing.
        while topics.is_empty() {
            match command_rx.recv().await {
                Some(StreamCommand::Subscribe(new)) => topics.extend(new),
                Some(StreamCommand::Unsubscribe(old)) => {
                    for t in &old {
                        topics.remove(t);
                    }
                }
                Some(StreamCommand::Shutdown) | None => return,
            }
        }

        match connection(&ws_url, &mut topics, &mut command_rx, &signal_tx).await {
            ConnectionEnd::Shutdown => return,
            ConnectionEnd::Dropped(reason) => {
                let _ = signal_tx
                    .send(StreamSignal::Disconnected {
                        reason: reason.clone(),
                    })
                    .await;
                let jitter = {
                    let mut rng = rand::rng();
                    Duration::from_millis(rng.random_range(0..500))
                };
                error!(err = %reason, backoff_secs = backoff.as_secs(), "stream dropped, reconnecting");
                tokio::time::sleep(backoff + jitter).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

enum ConnectionEnd {
    Shutdown,
    Dropped(String),
}

async fn connection(
    ws_url: &str,
    topics: &mut BTreeSet<String>,
    command_rx: &mut mpsc::Receiver<StreamCommand>,
    signal_tx: &mpsc::Sender<StreamSignal>,
) -> ConnectionEnd {
    info!(url = ws_url, topics = topics.len(), "connecting market stream");
    let (stream, _) = match connect_async(ws_url).await {
        Ok(ok) => ok,
        Err(e) => return ConnectionEnd::Dropped(format!("connect failed: {}", e)),
    };
    let (mut write, mut read) = stream.split();

    // Replay the whole topic set on every (re)connect.
    let replay: Vec<String> = topics.iter().cloned().collect();
    if !replay.is_empty()
        && let Err(e) = write
            .send(Message::Text(codec::encode_subscribe(&replay).into()))
            .await
    {
        return ConnectionEnd::Dropped(format!("subscribe failed: {}", e));
    }
    info!(topics = replay.len(), "market stream connected");
    let _ = signal_tx.send(StreamSignal::Connected).await;

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.reset();

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Text(codec::encode_ping().into())).await {
                    return ConnectionEnd::Dropped(format!("ping failed: {}", e));
                }
            }
            command = command_rx.recv() => {
                match command {
                    Some(StreamCommand::Subscribe(new)) => {
                        let fresh: Vec<String> = new
                            .into_iter()
                            .filter(|t| topics.insert(t.clone()))
                            .collect();
                        if fresh.is_empty() {
                            debug!("subscription already active, skipping");
                            continue;
                        }
                        if let Err(e) = write
                            .send(Message::Text(codec::encode_subscribe(&fresh).into()))
                            .await
                        {
                            return ConnectionEnd::Dropped(format!("subscribe failed: {}", e));
                        }
                    }
                    Some(StreamCommand::Unsubscribe(old)) => {
                        let removed: Vec<String> = old
                            .into_iter()
                            .filter(|t| topics.remove(t))
                            .collect();
                        if removed.is_empty() {
                            continue;
                        }
                        if let Err(e) = write
                            .send(Message::Text(codec::encode_unsubscribe(&removed).into()))
                            .await
                        {
                            return ConnectionEnd::Dropped(format!("unsubscribe failed: {}", e));
                        }
                    }
                    Some(StreamCommand::Shutdown) | None => return ConnectionEnd::Shutdown,
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match codec::decode_frame(&text) {
                            Ok(events) => {
                                for event in events {
                                    let _ = signal_tx.send(StreamSignal::Event(event)).await;
                                }
                            }
                            // Malformed payloads are dropped, the stream continues.
                            Err(err) => warn!(err = %err, "dropping undecodable frame"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if write.send(Message::Pong(payload)).await.is_err() {
                            return ConnectionEnd::Dropped("pong failed".to_string());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("closed by venue: {} {}", f.code, f.reason))
                            .unwrap_or_else(|| "closed by venue".to_string());
                        return ConnectionEnd::Dropped(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return ConnectionEnd::Dropped(format!("read error: {}", e)),
                    None => return ConnectionEnd::Dropped("stream ended".to_string()),
                }
            }
        }
    }
}
