use crate::runtime::ChildHandle;
use std::time::Duration;
use tracing::debug;

/// Per-child stop budget during tree shutdown.
pub const STOP_BUDGET: Duration = Duration::from_secs(5);

/// Ordered registry of a parent's children. Shutdown is post-order: the
/// most recently spawned child stops first, so leaves go down before the
/// components they feed.
#[derive(Default)]
pub struct ChildSet {
    children: Vec<ChildHandle>,
}

impl ChildSet {
    pub fn new() -> Self {
        ChildSet {
            children: Vec::new(),
        }
    }

    pub fn add(&mut self, handle: ChildHandle) {
        self.children.push(handle);
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Remove a child by name without stopping it (used when a failed child
    /// is being replaced).
    pub fn forget(&mut self, name: &str) -> Option<ChildHandle> {
        let idx = self.children.iter().position(|c| c.name() == name)?;
        Some(self.children.remove(idx))
    }

    /// Stop all children in reverse spawn order, each within [`STOP_BUDGET`].
    pub async fn shutdown(&mut self) {
        while let Some(child) = self.children.pop() {
            debug!(component = child.name(), "stopping child");
            child.stop(STOP_BUDGET).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::CoreError;
    use crate::runtime::{Actor, ActorContext, SpawnOpts, spawn};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Actor for Recorder {
        type Msg = ();

        async fn handle(&mut self, _msg: (), _ctx: &ActorContext<()>) -> Result<(), CoreError> {
            Ok(())
        }

        async fn stopped(&mut self) {
            self.log.lock().unwrap().push(self.name);
        }
    }

    #[tokio::test]
    async fn shutdown_is_reverse_spawn_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut children = ChildSet::new();
        for name in ["settings", "portfolio", "risk-gate"] {
            let (_addr, handle) = spawn(
                name,
                Recorder {
                    name,
                    log: log.clone(),
                },
                SpawnOpts::default(),
            );
            children.add(handle);
        }
        children.shutdown().await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["risk-gate", "portfolio", "settings"]
        );
        assert!(children.is_empty());
    }
}
