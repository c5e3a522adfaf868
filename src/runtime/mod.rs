//! Message-passing substrate for the trading core.
//!
//! Every component is an [`Actor`] owning private state behind a serialized
//! mailbox: at most one `handle` call runs at any time, so component state
//! needs no locking. Communication is `tell` (fire-and-forget) or `ask`
//! (request/response with a deadline); messages between one sender and one
//! receiver arrive in send order because mailboxes are FIFO channels.
//!
//! A handler error aborts only the current message. Fatal errors
//! ([`CoreError::Integrity`]) stop the component and surface to the parent
//! as a [`ChildEvent::Failed`], leaving the restart decision to the parent.

mod children;

pub use children::ChildSet;

use crate::domain::errors::CoreError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default deadline for requests between components.
pub const ASK_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for requests that go through exchange REST.
pub const EXCHANGE_ASK_TIMEOUT: Duration = Duration::from_secs(30);
/// Default mailbox capacity.
pub const MAILBOX_CAPACITY: usize = 256;

/// A stateful component driven by its mailbox.
#[async_trait]
pub trait Actor: Send + Sized + 'static {
    type Msg: Send + 'static;

    /// Runs once before the first message. An error here is fatal.
    async fn started(&mut self, _ctx: &ActorContext<Self::Msg>) -> Result<(), CoreError> {
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: Self::Msg,
        ctx: &ActorContext<Self::Msg>,
    ) -> Result<(), CoreError>;

    /// Runs once after the mailbox loop exits, in both the orderly-stop and
    /// the failure path.
    async fn stopped(&mut self) {}

    /// Which handler errors stop this component. Integrity violations are
    /// always fatal; components may widen the set (the exchange session
    /// stops on rejected credentials).
    fn is_fatal(&self, err: &CoreError) -> bool {
        err.is_fatal()
    }
}

/// Opaque address of a running actor. Cloneable; the actor itself owns the
/// receiving end.
pub struct Addr<M> {
    name: Arc<str>,
    tx: mpsc::Sender<M>,
}

impl<M> Clone for Addr<M> {
    fn clone(&self) -> Self {
        Addr {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<M: Send + 'static> Addr<M> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fire-and-forget. Waits for mailbox capacity; a message to a dead
    /// component is dropped and logged.
    pub async fn tell(&self, msg: M) {
        if self.tx.send(msg).await.is_err() {
            debug!(component = %self.name, "message to stopped component dropped");
        }
    }

    /// Non-waiting send for paths that must never block. Returns false when
    /// the mailbox is full or closed.
    pub fn try_tell(&self, msg: M) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Request/response: `make` builds the message around the reply slot.
    /// The caller's logical flow suspends until the reply arrives or the
    /// deadline passes; a reply after the deadline is discarded.
    pub async fn ask<R, F>(&self, make: F, timeout: Duration) -> Result<R, CoreError>
    where
        R: Send + 'static,
        F: FnOnce(oneshot::Sender<R>) -> M,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let waited_ms = timeout.as_millis() as u64;
        if self.tx.send(make(reply_tx)).await.is_err() {
            debug!(component = %self.name, "ask sent to stopped component");
            return Err(CoreError::timeout(self.name.to_string(), 0));
        }
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // Receiver side dropped the reply slot without answering.
            Ok(Err(_)) => Err(CoreError::timeout(self.name.to_string(), waited_ms)),
            Err(_) => Err(CoreError::timeout(self.name.to_string(), waited_ms)),
        }
    }
}

/// Handed to `started`/`handle`; lets an actor message itself (timers, I/O
/// task completions) without a reference cycle.
pub struct ActorContext<M> {
    addr: Addr<M>,
}

impl<M: Send + 'static> ActorContext<M> {
    pub fn addr(&self) -> Addr<M> {
        self.addr.clone()
    }

    pub fn name(&self) -> &str {
        self.addr.name()
    }
}

/// Lifecycle notification delivered to the parent's child-event channel.
#[derive(Debug)]
pub enum ChildEvent {
    /// The child's `started` or a fatal `handle` error stopped it.
    Failed { name: String, error: CoreError },
    /// The child exited through the orderly stop path.
    Stopped { name: String },
}

/// Handle owned by the parent: stop signal plus join handle.
pub struct ChildHandle {
    name: String,
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ChildHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the child to stop and wait up to `budget` for it to exit.
    /// A stuck child is aborted and logged.
    pub async fn stop(mut self, budget: Duration) {
        let _ = self.stop_tx.send(true);
        match tokio::time::timeout(budget, &mut self.join).await {
            Ok(_) => debug!(component = %self.name, "component stopped"),
            Err(_) => {
                warn!(component = %self.name, budget_ms = budget.as_millis() as u64,
                    "component did not stop within budget, aborting");
                self.join.abort();
            }
        }
    }

    pub fn abort(&self) {
        self.join.abort();
    }
}

pub struct SpawnOpts {
    pub mailbox: usize,
    /// Parent's child-event channel, when the parent supervises this actor.
    pub events: Option<mpsc::Sender<ChildEvent>>,
}

impl Default for SpawnOpts {
    fn default() -> Self {
        SpawnOpts {
            mailbox: MAILBOX_CAPACITY,
            events: None,
        }
    }
}

/// Spawn `actor` under `name` and return its address plus the parent-side
/// handle.
pub fn spawn<A: Actor>(name: impl Into<String>, actor: A, opts: SpawnOpts) -> (Addr<A::Msg>, ChildHandle) {
    let name = name.into();
    let (tx, rx) = mpsc::channel(opts.mailbox);
    let (stop_tx, stop_rx) = watch::channel(false);
    let addr = Addr {
        name: Arc::from(name.as_str()),
        tx,
    };
    let ctx = ActorContext { addr: addr.clone() };
    let task_name = name.clone();
    let join = tokio::spawn(run_loop(actor, ctx, rx, stop_rx, opts.events, task_name));
    (
        addr,
        ChildHandle {
            name,
            stop_tx,
            join,
        },
    )
}

async fn run_loop<A: Actor>(
    mut actor: A,
    ctx: ActorContext<A::Msg>,
    mut rx: mpsc::Receiver<A::Msg>,
    mut stop_rx: watch::Receiver<bool>,
    events: Option<mpsc::Sender<ChildEvent>>,
    name: String,
) {
    info!(component = %name, "component started");
    if let Err(err) = actor.started(&ctx).await {
        error!(component = %name, err = %err, "component failed to start");
        actor.stopped().await;
        notify(&events, ChildEvent::Failed { name, error: err }).await;
        return;
    }

    let mut failure: Option<CoreError> = None;
    loop {
        tokio::select! {
            // Stop signal wins over pending mailbox traffic.
            biased;
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            maybe = rx.recv() => {
                let Some(msg) = maybe else { break };
                if let Err(err) = actor.handle(msg, &ctx).await {
                    if actor.is_fatal(&err) {
                        error!(component = %name, err = %err, "fatal handler error, stopping component");
                        failure = Some(err);
                        break;
                    }
                    warn!(component = %name, err = %err, "message handler failed");
                }
            }
        }
    }

    actor.stopped().await;
    info!(component = %name, "component stopped");
    let event = match failure {
        Some(error) => ChildEvent::Failed { name, error },
        None => ChildEvent::Stopped { name },
    };
    notify(&events, event).await;
}

async fn notify(events: &Option<mpsc::Sender<ChildEvent>>, event: ChildEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        total: u64,
        seen: Vec<u64>,
    }

    enum CounterMsg {
        Add(u64),
        Get(oneshot::Sender<u64>),
        Seen(oneshot::Sender<Vec<u64>>),
        Fail,
        FatalFail,
        Sleep(Duration),
    }

    #[async_trait]
    impl Actor for Counter {
        type Msg = CounterMsg;

        async fn handle(
            &mut self,
            msg: CounterMsg,
            _ctx: &ActorContext<CounterMsg>,
        ) -> Result<(), CoreError> {
            match msg {
                CounterMsg::Add(n) => {
                    self.total += n;
                    self.seen.push(n);
                    Ok(())
                }
                CounterMsg::Get(reply) => {
                    let _ = reply.send(self.total);
                    Ok(())
                }
                CounterMsg::Seen(reply) => {
                    let _ = reply.send(self.seen.clone());
                    Ok(())
                }
                CounterMsg::Fail => Err(CoreError::Network("transient".into())),
                CounterMsg::FatalFail => Err(CoreError::Integrity("broken".into())),
                CounterMsg::Sleep(d) => {
                    tokio::time::sleep(d).await;
                    Ok(())
                }
            }
        }
    }

    fn counter() -> Counter {
        Counter {
            total: 0,
            seen: Vec::new(),
        }
    }

    #[tokio::test]
    async fn tell_then_ask_round_trip() {
        let (addr, handle) = spawn("counter", counter(), SpawnOpts::default());
        addr.tell(CounterMsg::Add(2)).await;
        addr.tell(CounterMsg::Add(3)).await;
        let total = addr.ask(CounterMsg::Get, ASK_TIMEOUT).await.unwrap();
        assert_eq!(total, 5);
        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn messages_from_one_sender_arrive_in_order() {
        let (addr, handle) = spawn("counter", counter(), SpawnOpts::default());
        for n in 0..100u64 {
            addr.tell(CounterMsg::Add(n)).await;
        }
        let seen = addr.ask(CounterMsg::Seen, ASK_TIMEOUT).await.unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn recoverable_error_keeps_component_alive() {
        let (addr, handle) = spawn("counter", counter(), SpawnOpts::default());
        addr.tell(CounterMsg::Fail).await;
        addr.tell(CounterMsg::Add(7)).await;
        let total = addr.ask(CounterMsg::Get, ASK_TIMEOUT).await.unwrap();
        assert_eq!(total, 7);
        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn fatal_error_stops_component_and_notifies_parent() {
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let (addr, _handle) = spawn(
            "counter",
            counter(),
            SpawnOpts {
                events: Some(events_tx),
                ..Default::default()
            },
        );
        addr.tell(CounterMsg::FatalFail).await;
        let event = events_rx.recv().await.unwrap();
        match event {
            ChildEvent::Failed { name, error } => {
                assert_eq!(name, "counter");
                assert!(matches!(error, CoreError::Integrity(_)));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        // The mailbox is gone; asks report promptly instead of hanging.
        let err = addr.ask(CounterMsg::Get, ASK_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout { .. }));
    }

    #[tokio::test]
    async fn ask_times_out_against_a_busy_component() {
        let (addr, handle) = spawn("counter", counter(), SpawnOpts::default());
        addr.tell(CounterMsg::Sleep(Duration::from_millis(300))).await;
        let err = addr
            .ask(CounterMsg::Get, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout { .. }));
        handle.stop(Duration::from_secs(1)).await;
    }
}
