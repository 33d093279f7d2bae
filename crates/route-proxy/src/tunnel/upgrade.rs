//! Upgrade interception.
//!
//! Middleware that sees every request under `/hubs/` before the HTTP tunnel
//! handler. WebSocket upgrades for `/hubs/:hubId/ws` and
//! `/hubs/:hubId/yws/<room>` are authenticated and claimed here; everything
//! else passes through untouched.

use super::http::split_hub_path;
use super::ws::{run_session, TunnelTarget};
use crate::auth::{authorize, AuthRejection};
use crate::server::AppState;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use route_core::is_valid_hub_id;
use tracing::{debug, warn};

/// Map a request path to `(hub_id, hub-local destination)` when it names a
/// tunnel endpoint.
pub fn tunnel_destination(path: &str) -> Option<(&str, &str)> {
    let (hub_id, rest) = split_hub_path(path)?;
    if rest == "/ws" {
        return Some((hub_id, rest));
    }
    let room = rest.strip_prefix("/yws/")?;
    if room.is_empty() {
        return None;
    }
    Some((hub_id, rest))
}

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Refuse an upgrade before any handshake.
fn refuse(status: StatusCode, body: &'static str) -> Response {
    (status, [(header::CONNECTION, "close")], body).into_response()
}

pub async fn intercept(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !is_websocket_upgrade(request.headers()) {
        return next.run(request).await;
    }
    let destination = tunnel_destination(request.uri().path())
        .map(|(hub_id, path)| (hub_id.to_string(), path.to_string()));
    let Some((hub_id, path)) = destination else {
        return next.run(request).await;
    };

    if !is_valid_hub_id(&hub_id) {
        return refuse(StatusCode::BAD_REQUEST, "invalid hub id");
    }

    let identity = match authorize(
        state.verifier.as_ref(),
        &state.policy,
        request.headers(),
        request.uri(),
        &hub_id,
    )
    .await
    {
        Ok(identity) => identity,
        Err(AuthRejection::Unauthorized) => {
            debug!(hub_id = %hub_id, path = %path, "refusing unauthenticated upgrade");
            return refuse(StatusCode::UNAUTHORIZED, "unauthorized");
        }
        Err(AuthRejection::Forbidden(reason)) => {
            warn!(hub_id = %hub_id, reason = %reason, "refusing cross-hub upgrade");
            return refuse(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    };

    let guard = match state.policy.acquire_tunnel() {
        Ok(guard) => guard,
        Err(reason) => {
            warn!(hub_id = %hub_id, reason = %reason, "refusing upgrade");
            return refuse(StatusCode::SERVICE_UNAVAILABLE, "too many tunnels");
        }
    };

    let query = request
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let (mut parts, _body) = request.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let target = TunnelTarget {
        hub_id,
        path,
        query,
    };
    upgrade.on_upgrade(move |socket| run_session(socket, state, target, identity, guard))
}
