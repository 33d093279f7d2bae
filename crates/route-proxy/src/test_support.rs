//! Shared fixtures for handler tests: a seeded verifier, a fake hub on the
//! bus, and a real listening server.

use crate::auth::TokenVerifier;
use crate::bus::{Bus, MemoryBus};
use crate::config::ProxyConfig;
use crate::server::{router, AppState};
use route_core::subject::{key_from_subject, TO_HUB_PREFIX};
use route_core::{subjects_for, CorrelationKey, Envelope, Identity};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Session token owned by hub `h1`.
pub const TOKEN_H1: &str = "tok-h1";
/// Session token owned by hub `h2`.
pub const TOKEN_H2: &str = "tok-h2";
/// Hub credential for `h1` on `/bus/link`.
pub const HUB_TOKEN_H1: &str = "hub-h1";

pub fn test_state(config: ProxyConfig, bus: &MemoryBus) -> AppState {
    let mut sessions = HashMap::new();
    sessions.insert(TOKEN_H1.to_string(), Identity::owner("h1"));
    sessions.insert(TOKEN_H2.to_string(), Identity::owner("h2"));
    sessions.insert(HUB_TOKEN_H1.to_string(), Identity::hub("h1"));
    let verifier = TokenVerifier::new(config.token_secret.clone(), sessions);
    AppState::new(config, Arc::new(bus.clone()), Arc::new(verifier))
}

pub async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router(state)).await });
    addr
}

/// A hub listening on `route.to_hub.>`, surfacing what it receives.
pub struct FakeHub {
    bus: MemoryBus,
    rx: mpsc::UnboundedReceiver<(CorrelationKey, Envelope)>,
    task: JoinHandle<()>,
}

impl FakeHub {
    /// Subscribes before returning, so nothing published afterwards is missed.
    pub async fn attach(bus: &MemoryBus) -> Self {
        let mut sub = bus
            .subscribe(&format!("{TO_HUB_PREFIX}.>"))
            .await
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let Some(key) = key_from_subject(&msg.subject, TO_HUB_PREFIX) else {
                    continue;
                };
                let Ok(env) = Envelope::decode(&msg.payload) else {
                    continue;
                };
                if tx.send((key, env)).is_err() {
                    break;
                }
            }
        });
        Self {
            bus: bus.clone(),
            rx,
            task,
        }
    }

    pub async fn recv(&mut self) -> (CorrelationKey, Envelope) {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("fake hub timed out")
            .expect("fake hub stopped")
    }

    pub fn try_recv(&mut self) -> Option<(CorrelationKey, Envelope)> {
        self.rx.try_recv().ok()
    }

    /// Publish `env` on the browser-bound subject of `key`.
    pub async fn send(&self, key: &CorrelationKey, env: &Envelope) {
        self.bus
            .publish(&subjects_for(key).to_browser, env.encode().unwrap())
            .await
            .unwrap();
    }
}

impl Drop for FakeHub {
    fn drop(&mut self) {
        self.task.abort();
    }
}
