//! Caller authentication for tunnel requests.
//!
//! Token sources, in priority order: `Authorization: Bearer <token>`, the
//! `token` query parameter, then the `X-Adaos-Session` header. The first
//! candidate that verifies wins.

pub mod verifier;

pub use verifier::{SessionVerifier, TokenVerifier};

use crate::tunnel::policy::RoutePolicyEnforcer;
use axum::extract::Query;
use axum::http::{header, HeaderMap, Uri};
use route_core::Identity;
use std::collections::HashMap;
use tracing::debug;

/// Session header checked after the bearer token and query parameter.
pub const SESSION_HEADER: &str = "x-adaos-session";

/// Why a caller was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRejection {
    /// No candidate token verified.
    Unauthorized,
    /// Verified, but not allowed to reach this hub.
    Forbidden(String),
}

/// Collect token candidates from a request, in priority order.
pub fn token_candidates(headers: &HeaderMap, uri: &Uri) -> Vec<String> {
    let mut out = Vec::new();

    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if auth.len() > 7 && auth[..7].eq_ignore_ascii_case("bearer ") {
            let token = auth[7..].trim();
            if !token.is_empty() {
                out.push(token.to_string());
            }
        }
    }

    if let Ok(Query(params)) = Query::<HashMap<String, String>>::try_from_uri(uri) {
        if let Some(token) = params.get("token").filter(|t| !t.is_empty()) {
            out.push(token.clone());
        }
    }

    if let Some(token) = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        out.push(token.to_string());
    }

    out
}

/// Resolve the caller's identity from the first candidate that verifies.
pub async fn authenticate(
    verifier: &dyn SessionVerifier,
    headers: &HeaderMap,
    uri: &Uri,
) -> Option<Identity> {
    for candidate in token_candidates(headers, uri) {
        if let Some(found) = verifier.verify(&candidate).await {
            return Some(found);
        }
    }
    None
}

/// Resolve the caller's identity and apply the hub access policy.
///
/// Runs before any bus traffic for the request.
pub async fn authorize(
    verifier: &dyn SessionVerifier,
    policy: &RoutePolicyEnforcer,
    headers: &HeaderMap,
    uri: &Uri,
    hub_id: &str,
) -> Result<Identity, AuthRejection> {
    let identity = authenticate(verifier, headers, uri)
        .await
        .ok_or(AuthRejection::Unauthorized)?;

    policy
        .check_hub_access(&identity, hub_id)
        .map_err(AuthRejection::Forbidden)?;

    debug!(hub_id = %hub_id, owner = %identity.owner_id, "caller authorized");
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::policy::RoutePolicy;
    use axum::http::HeaderValue;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn candidates_in_priority_order() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("from-header"));
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-bearer"),
        );
        let got = token_candidates(&headers, &uri("/hubs/h1/api/x?token=from-query&a=1"));
        assert_eq!(got, vec!["from-bearer", "from-query", "from-header"]);
    }

    #[test]
    fn non_bearer_authorization_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(token_candidates(&headers, &uri("/x")).is_empty());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer   "));
        assert!(token_candidates(&headers, &uri("/x")).is_empty());
    }

    #[test]
    fn query_token_is_percent_decoded() {
        let got = token_candidates(&HeaderMap::new(), &uri("/x?token=a%2Bb"));
        assert_eq!(got, vec!["a+b"]);
    }

    #[tokio::test]
    async fn later_candidate_can_verify() {
        let verifier = TokenVerifier::new(None, HashMap::new());
        verifier.insert_session("good", Identity::owner("h1")).await;
        let policy = RoutePolicyEnforcer::new(RoutePolicy::default());

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer stale"));
        headers.insert(SESSION_HEADER, HeaderValue::from_static("good"));

        let id = authorize(&verifier, &policy, &headers, &uri("/"), "h1")
            .await
            .unwrap();
        assert_eq!(id.owner_id, "h1");
    }

    #[tokio::test]
    async fn strict_policy_forbids_other_hubs() {
        let verifier = TokenVerifier::new(None, HashMap::new());
        verifier.insert_session("tok", Identity::owner("h1")).await;
        let strict = RoutePolicyEnforcer::new(RoutePolicy {
            allow_cross_hub: false,
            ..RoutePolicy::default()
        });
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("tok"));

        assert!(authorize(&verifier, &strict, &headers, &uri("/"), "h1").await.is_ok());
        assert!(matches!(
            authorize(&verifier, &strict, &headers, &uri("/"), "h2").await,
            Err(AuthRejection::Forbidden(_))
        ));
        assert_eq!(
            authorize(&verifier, &strict, &HeaderMap::new(), &uri("/"), "h1").await,
            Err(AuthRejection::Unauthorized)
        );
    }
}
