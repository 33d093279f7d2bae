//! Hub link: `GET /bus/link`.
//!
//! Hubs sit behind NAT and cannot be dialed, so each one opens an outbound
//! WebSocket to the edge and the link bridges it onto the bus. A hub
//! authenticates with a hub-role token whose `owner_id` is its hub id and
//! only ever sees, or answers on, its own subjects. Browser sessions are
//! refused: they would otherwise see other callers' forwarded credentials.
//!
//! ```text
//! edge → hub   {"op":"msg","subject":"route.to_hub.<hub>--…","payload":"<envelope>"}
//! hub  → edge  {"op":"pub","subject":"route.to_browser.<hub>--…","payload":"<envelope>"}
//! hub  → edge  {"op":"ping"}   edge → hub {"op":"pong"}
//! ```

use super::Bus;
use crate::auth::authenticate;
use crate::server::AppState;
use crate::tunnel::policy::ConnectionGuard;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use route_core::subject::{key_from_subject, TO_BROWSER_PREFIX, TO_HUB_PREFIX};
use route_core::{is_valid_hub_id, Role};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One JSON text frame on a hub link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LinkFrame {
    /// A bus message for the hub.
    Msg { subject: String, payload: String },
    /// A publish from the hub.
    Pub { subject: String, payload: String },
    Ping,
    Pong,
}

/// Whether `subject` is `<prefix>.<hub_id>--…`.
fn owned_by(subject: &str, prefix: &str, hub_id: &str) -> bool {
    key_from_subject(subject, prefix).is_some_and(|key| key.hub_id() == hub_id)
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &LinkFrame,
) -> Result<(), ()> {
    let text = serde_json::to_string(frame).map_err(|e| {
        warn!(error = %e, "failed to encode link frame");
    })?;
    sink.send(Message::Text(text)).await.map_err(|e| {
        debug!(error = %e, "hub link send failed");
    })
}

pub async fn handle_link(State(state): State<AppState>, request: Request) -> Response {
    let Some(identity) =
        authenticate(state.verifier.as_ref(), request.headers(), request.uri()).await
    else {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    };
    if identity.role != Role::Hub {
        warn!(owner = %identity.owner_id, "refusing link for a non-hub credential");
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }
    let hub_id = identity.owner_id;
    if !is_valid_hub_id(&hub_id) {
        warn!(hub_id = %hub_id, "refusing link for invalid hub id");
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }

    let guard = match state.policy.acquire_link() {
        Ok(guard) => guard,
        Err(reason) => {
            warn!(hub_id = %hub_id, reason = %reason, "refusing hub link");
            return (StatusCode::SERVICE_UNAVAILABLE, "too many hub links").into_response();
        }
    };

    let (mut parts, _body) = request.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    let bus = state.bus.clone();
    let verbose = state.config.verbose;
    upgrade.on_upgrade(move |socket| run_link(socket, bus, hub_id, guard, verbose))
}

/// Bridge one hub link until either side goes away.
pub async fn run_link(
    mut socket: WebSocket,
    bus: Arc<dyn Bus>,
    hub_id: String,
    guard: ConnectionGuard,
    verbose: bool,
) {
    let _guard = guard;
    let mut sub = match bus.subscribe(&format!("{TO_HUB_PREFIX}.*")).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!(hub_id = %hub_id, error = %e, "hub link subscribe failed");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: "bus error".into(),
                })))
                .await;
            return;
        }
    };
    info!(hub_id = %hub_id, "hub link attached");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            msg = sub.next() => {
                let Some(msg) = msg else {
                    warn!(hub_id = %hub_id, "hub link subscription closed");
                    break;
                };
                if !owned_by(&msg.subject, TO_HUB_PREFIX, &hub_id) {
                    continue;
                }
                if verbose {
                    debug!(hub_id = %hub_id, subject = %msg.subject, bytes = msg.payload.len(), "→ link");
                }
                let frame = LinkFrame::Msg {
                    subject: msg.subject,
                    payload: String::from_utf8_lossy(&msg.payload).into_owned(),
                };
                if send_frame(&mut sink, &frame).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(hub_id = %hub_id, error = %e, "hub link read failed");
                        break;
                    }
                };
                match serde_json::from_str::<LinkFrame>(&text) {
                    Ok(LinkFrame::Pub { subject, payload }) => {
                        if !owned_by(&subject, TO_BROWSER_PREFIX, &hub_id) {
                            warn!(hub_id = %hub_id, subject = %subject, "dropping publish outside hub namespace");
                            continue;
                        }
                        if verbose {
                            debug!(hub_id = %hub_id, subject = %subject, bytes = payload.len(), "← link");
                        }
                        if let Err(e) = bus.publish(&subject, payload.into_bytes()).await {
                            warn!(hub_id = %hub_id, subject = %subject, error = %e, "hub publish failed");
                        }
                    }
                    Ok(LinkFrame::Ping) => {
                        if send_frame(&mut sink, &LinkFrame::Pong).await.is_err() {
                            break;
                        }
                    }
                    Ok(other) => debug!(hub_id = %hub_id, frame = ?other, "ignoring link frame"),
                    Err(e) => warn!(hub_id = %hub_id, error = %e, "malformed link frame"),
                }
            }
        }
    }

    drop(sub);
    let _ = sink.close().await;
    info!(hub_id = %hub_id, "hub link detached");
}
