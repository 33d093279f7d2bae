//! In-process bus with NATS-style subject matching.
//!
//! Subjects are dot-separated tokens. In a subscription pattern `*` matches
//! exactly one token and `>` matches one or more trailing tokens.

use super::{Bus, BusMessage, Subscription};
use async_trait::async_trait;
use route_core::{RouteError, RouteResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default payload ceiling (2 MiB): a text frame at the default chunk
/// ceiling fits even when every byte is escaped.
pub const DEFAULT_MAX_PAYLOAD: usize = 2 * 1024 * 1024;
/// Per-subscription queue depth; messages beyond it are dropped.
const SUBSCRIPTION_QUEUE: usize = 1024;

struct Entry {
    pattern: String,
    tx: mpsc::Sender<BusMessage>,
}

struct Inner {
    subs: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    max_payload: usize,
    offline: AtomicBool,
}

/// Shared in-memory bus. Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl MemoryBus {
    pub fn new(max_payload: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subs: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                max_payload,
                offline: AtomicBool::new(false),
            }),
        }
    }

    /// Number of live subscriptions.
    #[cfg(test)]
    pub fn subscription_count(&self) -> usize {
        self.lock().len()
    }

    /// Simulate an outage: while offline every operation fails.
    #[cfg(test)]
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::Relaxed);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Entry>> {
        self.inner.subs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> RouteResult<()> {
        if self.inner.offline.load(Ordering::Relaxed) {
            return Err(RouteError::Bus("bus offline".into()));
        }
        Ok(())
    }
}

fn valid_subject(subject: &str, allow_wildcards: bool) -> bool {
    !subject.is_empty()
        && subject.split('.').all(|t| {
            !t.is_empty() && (allow_wildcards || (t != "*" && t != ">"))
        })
}

/// Match a concrete subject against a subscription pattern.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn connect(&self) -> RouteResult<()> {
        self.check_online()
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> RouteResult<()> {
        self.check_online()?;
        if !valid_subject(subject, false) {
            return Err(RouteError::Bus(format!("invalid publish subject: {subject}")));
        }
        if payload.len() > self.inner.max_payload {
            return Err(RouteError::Bus(format!(
                "payload too large: {} bytes (max {})",
                payload.len(),
                self.inner.max_payload
            )));
        }

        let subs = self.lock();
        let mut delivered = 0usize;
        for entry in subs.values() {
            if !subject_matches(&entry.pattern, subject) {
                continue;
            }
            let msg = BusMessage {
                subject: subject.to_string(),
                payload: payload.clone(),
            };
            match entry.tx.try_send(msg) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subject = %subject, pattern = %entry.pattern, "subscriber queue full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        debug!(subject = %subject, delivered, "published");
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> RouteResult<Subscription> {
        self.check_online()?;
        if !valid_subject(subject, true) {
            return Err(RouteError::Bus(format!("invalid subscribe subject: {subject}")));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE);
        self.lock().insert(
            id,
            Entry {
                pattern: subject.to_string(),
                tx,
            },
        );

        let bus = self.clone();
        Ok(Subscription::new(subject, rx, move || {
            bus.lock().remove(&id);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn wildcard_matching() {
        assert!(subject_matches("route.to_hub.h1--a", "route.to_hub.h1--a"));
        assert!(subject_matches("route.to_hub.*", "route.to_hub.h1--a"));
        assert!(subject_matches("route.>", "route.to_hub.h1--a"));
        assert!(!subject_matches("route.to_hub.*", "route.to_hub"));
        assert!(!subject_matches("route.to_hub.*", "route.to_hub.a.b"));
        assert!(!subject_matches("route.to_hub.>", "route.to_hub"));
        assert!(!subject_matches("route.to_hub.a", "route.to_browser.a"));
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscribers_only() {
        let bus = MemoryBus::default();
        let mut exact = bus.subscribe("a.b").await.unwrap();
        let mut wild = bus.subscribe("a.*").await.unwrap();
        let mut other = bus.subscribe("c.d").await.unwrap();

        bus.publish("a.b", b"hello".to_vec()).await.unwrap();

        assert_eq!(exact.next().await.unwrap().payload, b"hello");
        let msg = wild.next().await.unwrap();
        assert_eq!(msg.subject, "a.b");
        assert!(tokio::time::timeout(Duration::from_millis(50), other.next())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn drop_releases_subscription() {
        let bus = MemoryBus::default();
        let sub = bus.subscribe("x.y").await.unwrap();
        let sub2 = bus.subscribe("x.*").await.unwrap();
        assert_eq!(bus.subscription_count(), 2);
        drop(sub);
        assert_eq!(bus.subscription_count(), 1);
        drop(sub2);
        assert_eq!(bus.subscription_count(), 0);
        // Nobody listening is not an error.
        bus.publish("x.y", vec![1]).await.unwrap();
    }

    #[tokio::test]
    async fn oversized_payload_rejected() {
        let bus = MemoryBus::new(8);
        assert!(bus.publish("a.b", vec![0; 8]).await.is_ok());
        assert!(matches!(
            bus.publish("a.b", vec![0; 9]).await,
            Err(RouteError::Bus(_))
        ));
    }

    #[tokio::test]
    async fn offline_bus_fails_everything() {
        let bus = MemoryBus::default();
        bus.set_offline(true);
        assert!(bus.connect().await.is_err());
        assert!(bus.publish("a.b", vec![]).await.is_err());
        assert!(bus.subscribe("a.b").await.is_err());
        bus.set_offline(false);
        assert!(bus.connect().await.is_ok());
    }

    #[tokio::test]
    async fn invalid_subjects_rejected() {
        let bus = MemoryBus::default();
        assert!(bus.publish("a.*", vec![]).await.is_err());
        assert!(bus.publish("", vec![]).await.is_err());
        assert!(bus.subscribe("a..b").await.is_err());
    }
}
