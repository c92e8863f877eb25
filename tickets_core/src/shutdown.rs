//! Process-wide shutdown and readiness signals shared by the forwarder and the router.

use std::sync::Arc;
use tokio::sync::watch;

/// Creates a linked trigger/listener pair.
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx: Arc::new(tx) }, Shutdown { rx })
}

/// Fires the shutdown signal for every linked [`Shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    /// Signals shutdown. Calling it more than once is harmless.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Creates another listener for this trigger.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

/// Listens for the shutdown signal.
///
/// A dropped trigger counts as shutdown so that loops never outlive their owner.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Returns whether shutdown was already signalled.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is signalled.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

/// A readiness flag that components flip once they are consuming.
#[derive(Debug, Clone)]
pub struct Readiness {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    /// Creates a flag that is not ready.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Sets the flag.
    pub fn set(&self, ready: bool) {
        self.tx.send_replace(ready);
    }

    /// Returns whether the component is ready.
    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the component is ready.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }
}
