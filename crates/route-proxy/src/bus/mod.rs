//! Pub/sub bus: the only path between the edge and a hub.
//!
//! The proxy assumes at-least-once, unordered delivery to current
//! subscribers, with a bus-defined payload ceiling. [`Bus`] is the seam;
//! [`MemoryBus`] is the in-process implementation, and [`link`] lets hubs
//! behind NAT attach to it over an outbound WebSocket.
//!
//! Subscriptions are RAII handles: dropping a [`Subscription`] unsubscribes
//! it, exactly once, on every exit path.

pub mod link;
pub mod memory;

pub use memory::MemoryBus;

use async_trait::async_trait;
use route_core::RouteResult;
use tokio::sync::mpsc;

/// A message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// Bus client capability required by the proxy.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Check the bus is reachable.
    async fn connect(&self) -> RouteResult<()>;

    /// Publish `payload` to every current subscriber of `subject`.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> RouteResult<()>;

    /// Subscribe to `subject` (may contain `*` / `>` wildcards).
    async fn subscribe(&self, subject: &str) -> RouteResult<Subscription>;
}

/// A live subscription. Messages arrive through [`Subscription::next`];
/// dropping the handle releases it on the bus.
pub struct Subscription {
    subject: String,
    rx: mpsc::Receiver<BusMessage>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(
        subject: impl Into<String>,
        rx: mpsc::Receiver<BusMessage>,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            rx,
            release: Some(Box::new(release)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Wait for the next message. `None` once the bus side has gone away.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .finish()
    }
}
