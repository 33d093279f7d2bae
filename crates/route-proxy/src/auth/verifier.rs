//! Session verification: signed token first, session store second.

use async_trait::async_trait;
use route_core::{verify_token, Identity};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Resolves a bearer token to an identity.
#[async_trait]
pub trait SessionVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<Identity>;
}

/// Verifier backed by the HMAC token secret and a static session store.
pub struct TokenVerifier {
    /// Secret for signed tokens; `None` disables the signed-token check.
    secret: Option<Vec<u8>>,
    /// Raw session token → identity.
    sessions: RwLock<HashMap<String, Identity>>,
}

impl TokenVerifier {
    pub fn new(secret: Option<Vec<u8>>, sessions: HashMap<String, Identity>) -> Self {
        Self {
            secret,
            sessions: RwLock::new(sessions),
        }
    }

    /// Register a session token.
    #[cfg(test)]
    pub async fn insert_session(&self, token: impl Into<String>, identity: Identity) {
        self.sessions.write().await.insert(token.into(), identity);
    }

    /// Revoke a session token. Returns whether it existed.
    #[cfg(test)]
    pub async fn revoke_session(&self, token: &str) -> bool {
        self.sessions.write().await.remove(token).is_some()
    }
}

#[async_trait]
impl SessionVerifier for TokenVerifier {
    async fn verify(&self, token: &str) -> Option<Identity> {
        if token.is_empty() {
            return None;
        }
        if let Some(secret) = &self.secret {
            match verify_token(secret, token) {
                Ok(identity) => return Some(identity),
                Err(e) => debug!(error = %e, "signed token rejected, trying session store"),
            }
        }
        self.sessions.read().await.get(token).cloned()
    }
}
