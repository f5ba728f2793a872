//! Process-wide shutdown signal.
//!
//! One `watch` channel is created by the orchestrator. Listeners, their
//! connections, and detached tunnels each hold a [`ShutdownSignal`] clone and
//! stop when it flips to `true`.

use tokio::sync::watch;

/// Sending half, owned by the orchestrator.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

/// Receiving half, cloned into every listener, connection, and tunnel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

/// Create a connected trigger/signal pair.
#[must_use]
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), ShutdownSignal(rx))
}

impl ShutdownTrigger {
    /// Ask every holder of a matching signal to stop.
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    #[must_use]
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal(self.0.subscribe())
    }
}

impl ShutdownSignal {
    #[must_use]
    pub fn is_requested(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown has been triggered.
    ///
    /// If the trigger is dropped without firing, this never resolves: the
    /// owner went away, not the process.
    pub async fn requested(mut self) {
        if self.0.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
