//! HMAC-signed session tokens.
//!
//! Tokens let a browser or hub prove an identity without a session-store
//! round trip.
//! Format: `<base64url(JSON claims)>.<hex HMAC-SHA256 of the claims segment>`

use crate::error::{RouteError, RouteResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use ring::hmac;
use serde::{Deserialize, Serialize};

/// What a credential may be used for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Browser traffic through the tunnels.
    #[default]
    Browser,
    /// A hub attaching over `/bus/link`; `owner_id` is the hub id.
    Hub,
}

/// The identity a session token resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(default)]
    pub role: Role,
}

impl Identity {
    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            browser_key_id: None,
            sid: None,
            role: Role::Browser,
        }
    }

    /// Credential for hub `hub_id` itself.
    pub fn hub(hub_id: impl Into<String>) -> Self {
        Self {
            role: Role::Hub,
            ..Self::owner(hub_id)
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(flatten)]
    identity: Identity,
    exp: u64,
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Create a session token for `identity`, valid for `ttl_secs`.
pub fn create_token(secret: &[u8], identity: &Identity, ttl_secs: u64) -> RouteResult<String> {
    let claims = Claims {
        identity: identity.clone(),
        exp: now_secs().saturating_add(ttl_secs),
    };
    let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, body.as_bytes());

    Ok(format!("{body}.{}", hex::encode(tag.as_ref())))
}

/// Verify a session token.
///
/// Checks the HMAC signature first, then the expiry time.
pub fn verify_token(secret: &[u8], token: &str) -> RouteResult<Identity> {
    let (body, sig_hex) = token
        .split_once('.')
        .ok_or_else(|| RouteError::Token("malformed token".into()))?;
    let sig =
        hex::decode(sig_hex).map_err(|_| RouteError::Token("malformed token signature".into()))?;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, body.as_bytes(), &sig)
        .map_err(|_| RouteError::Token("invalid token signature".into()))?;

    let claims: Claims = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(body)?)?;
    if now_secs() > claims.exp {
        return Err(RouteError::Token("token expired".into()));
    }
    if claims.identity.owner_id.is_empty() {
        return Err(RouteError::Token("token has no owner".into()));
    }
    Ok(claims.identity)
}

/// Generate a random token secret (32 bytes).
pub fn generate_secret() -> Vec<u8> {
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}
