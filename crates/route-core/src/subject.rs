//! Correlation keys and the subject naming scheme.
//!
//! A correlation key identifies one exchange:
//!
//! - HTTP: `<hub_id>--http--<random>`
//! - WebSocket: `<hub_id>--<random>`
//!
//! Each key maps to exactly one subject pair, `route.to_hub.<key>` and
//! `route.to_browser.<key>`.

use std::fmt;

/// Subject prefix for proxy → hub traffic.
pub const TO_HUB_PREFIX: &str = "route.to_hub";
/// Subject prefix for hub → proxy traffic.
pub const TO_BROWSER_PREFIX: &str = "route.to_browser";
/// Separator between the hub id and the rest of a correlation key.
pub const KEY_SEPARATOR: &str = "--";

/// Hub ids become part of a subject token, so they must not contain subject
/// separators, wildcards, whitespace, or the key separator. A trailing `-`
/// would run into the separator and is rejected too.
pub fn is_valid_hub_id(hub_id: &str) -> bool {
    !hub_id.is_empty()
        && !hub_id.contains(KEY_SEPARATOR)
        && !hub_id.ends_with('-')
        && hub_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// 16 random hex characters.
pub fn random_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// A freshly minted correlation key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    /// Mint a key for one HTTP exchange.
    pub fn for_http(hub_id: &str) -> Self {
        Self(format!(
            "{hub_id}{KEY_SEPARATOR}http{KEY_SEPARATOR}{}",
            random_id()
        ))
    }

    /// Mint a key for one WebSocket tunnel session.
    pub fn for_ws(hub_id: &str) -> Self {
        Self(format!("{hub_id}{KEY_SEPARATOR}{}", random_id()))
    }

    /// Parse a key received from the bus (e.g. the tail of a subject).
    pub fn parse(raw: &str) -> Option<Self> {
        let (hub, rest) = raw.split_once(KEY_SEPARATOR)?;
        if !is_valid_hub_id(hub) || rest.is_empty() || rest.contains('.') {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hub this key is scoped to.
    pub fn hub_id(&self) -> &str {
        self.0
            .split_once(KEY_SEPARATOR)
            .map(|(hub, _)| hub)
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two subjects used by one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectPair {
    /// Proxy → hub.
    pub to_hub: String,
    /// Hub → proxy.
    pub to_browser: String,
}

/// Derive the subject pair for a correlation key.
pub fn subjects_for(key: &CorrelationKey) -> SubjectPair {
    SubjectPair {
        to_hub: format!("{TO_HUB_PREFIX}.{key}"),
        to_browser: format!("{TO_BROWSER_PREFIX}.{key}"),
    }
}

/// Extract the correlation key from a `<prefix>.<key>` subject.
pub fn key_from_subject(subject: &str, prefix: &str) -> Option<CorrelationKey> {
    let tail = subject.strip_prefix(prefix)?.strip_prefix('.')?;
    CorrelationKey::parse(tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_key_shape() {
        let key = CorrelationKey::for_http("h1");
        let parts: Vec<&str> = key.as_str().split("--").collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "h1");
        assert_eq!(parts[1], "http");
        assert_eq!(parts[2].len(), 16);
        assert_eq!(key.hub_id(), "h1");
    }

    #[test]
    fn ws_key_shape() {
        let key = CorrelationKey::for_ws("hub-7");
        assert!(key.as_str().starts_with("hub-7--"));
        assert_eq!(key.hub_id(), "hub-7");
    }

    #[test]
    fn keys_are_unique() {
        let a = CorrelationKey::for_ws("h1");
        let b = CorrelationKey::for_ws("h1");
        assert_ne!(a, b);
    }

    #[test]
    fn subject_pair_naming() {
        let key = CorrelationKey::parse("h1--abc").unwrap();
        let pair = subjects_for(&key);
        assert_eq!(pair.to_hub, "route.to_hub.h1--abc");
        assert_eq!(pair.to_browser, "route.to_browser.h1--abc");
    }

    #[test]
    fn key_from_subject_round_trip() {
        let key = CorrelationKey::for_http("h2");
        let pair = subjects_for(&key);
        assert_eq!(key_from_subject(&pair.to_hub, TO_HUB_PREFIX), Some(key.clone()));
        assert_eq!(key_from_subject(&pair.to_browser, TO_BROWSER_PREFIX), Some(key));
        assert_eq!(key_from_subject("route.to_hub", TO_HUB_PREFIX), None);
        assert_eq!(key_from_subject("other.h1--x", TO_HUB_PREFIX), None);
    }

    #[test]
    fn hub_id_validation() {
        assert!(is_valid_hub_id("h1"));
        assert!(is_valid_hub_id("hub_a-1"));
        assert!(!is_valid_hub_id(""));
        assert!(!is_valid_hub_id("a--b"));
        assert!(!is_valid_hub_id("a.b"));
        assert!(!is_valid_hub_id("a*"));
        assert!(!is_valid_hub_id(">"));
        assert!(!is_valid_hub_id("a b"));
        assert!(!is_valid_hub_id("a-"));
    }
}
