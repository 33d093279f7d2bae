//! HTTP tunnel: `ANY /hubs/:hubId/api/*`.
//!
//! The request is serialized into an `http` envelope, sent to the hub over a
//! fresh subject pair, and the hub's `http_resp` is replayed as the response.
//! Bus failures and timeouts become a bare `502 hub unreachable`; the detail
//! only goes to the log.

use super::truncate_chars;
use crate::auth::{authorize, AuthRejection};
use crate::server::AppState;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use route_core::{is_valid_hub_id, HeaderMap as EnvelopeHeaders, HttpReply, HttpRequest};
use tracing::{debug, info, warn};

/// Set to `1` when the hub truncated the reply body.
pub const PROXY_TRUNCATED_HEADER: &str = "x-adaos-proxy-truncated";
/// Hub-reported error message, cut to [`MAX_ERROR_HEADER_CHARS`].
pub const PROXY_ERROR_HEADER: &str = "x-adaos-proxy-error";
pub const MAX_ERROR_HEADER_CHARS: usize = 200;

/// Request headers never forwarded to the hub.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "http2-settings",
];

/// Reply headers never replayed to the caller. `content-length` is
/// recomputed from the decoded body.
const STRIPPED_REPLY_HEADERS: &[&str] = &[
    "transfer-encoding",
    "connection",
    "content-length",
    "keep-alive",
    "upgrade",
];

/// Split `/hubs/<hub>/<rest>` into the hub id and the hub-local path.
pub fn split_hub_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/hubs/")?;
    match rest.find('/') {
        Some(i) => Some((&rest[..i], &rest[i..])),
        None => Some((rest, "")),
    }
}

/// Lower-cased header map for the envelope, minus hop-by-hop and
/// upgrade-negotiation headers. Repeated headers are joined with `", "`.
pub fn normalize_headers(headers: &HeaderMap) -> EnvelopeHeaders {
    let mut out = EnvelopeHeaders::new();
    for (name, value) in headers {
        let name = name.as_str();
        if STRIPPED_REQUEST_HEADERS.contains(&name) || name.starts_with("sec-websocket-") {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        out.entry(name.to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

fn plain(status: StatusCode, body: &'static str) -> Response {
    (status, body).into_response()
}

fn hub_unreachable() -> Response {
    plain(StatusCode::BAD_GATEWAY, "hub unreachable")
}

/// Read the body as base64. GET/HEAD and empty bodies yield `None`.
async fn read_body(
    method: &Method,
    headers: &HeaderMap,
    body: Body,
    limit: usize,
) -> Result<Option<String>, Response> {
    if method == Method::GET || method == Method::HEAD {
        return Ok(None);
    }
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        return Err(plain(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"));
    }
    let bytes = axum::body::to_bytes(body, limit).await.map_err(|e| {
        debug!(error = %e, "failed to read request body");
        plain(StatusCode::PAYLOAD_TOO_LARGE, "request body too large")
    })?;
    if bytes.is_empty() {
        Ok(None)
    } else {
        Ok(Some(B64.encode(&bytes)))
    }
}

/// Replay a hub reply as an HTTP response.
fn replay(hub_id: &str, path: &str, reply: HttpReply) -> Response {
    let Ok(status) = StatusCode::from_u16(reply.status) else {
        warn!(hub_id = %hub_id, path = %path, status = reply.status, "hub replied with invalid status");
        return hub_unreachable();
    };
    let body = match reply.body() {
        Ok(b) => b,
        Err(e) => {
            warn!(hub_id = %hub_id, path = %path, error = %e, "hub reply body undecodable");
            return hub_unreachable();
        }
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();

    for (name, value) in &reply.headers {
        let lower = name.to_ascii_lowercase();
        if STRIPPED_REPLY_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        match (
            HeaderName::from_bytes(lower.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(n), Ok(v)) => {
                headers.append(n, v);
            }
            _ => debug!(hub_id = %hub_id, header = %name, "dropping invalid reply header"),
        }
    }

    if reply.truncated {
        headers.insert(PROXY_TRUNCATED_HEADER, HeaderValue::from_static("1"));
    }
    if let Some(err) = &reply.err {
        let shown: String = truncate_chars(err, MAX_ERROR_HEADER_CHARS)
            .chars()
            .map(|c| if c == ' ' || c.is_ascii_graphic() { c } else { '?' })
            .collect();
        if let Ok(v) = HeaderValue::from_str(&shown) {
            headers.insert(PROXY_ERROR_HEADER, v);
        }
    }
    response
}

/// Handler for every request under `/hubs/`.
pub async fn handle_http(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path();

    let Some((hub_id, local_path)) = split_hub_path(path) else {
        return plain(StatusCode::NOT_FOUND, "not found");
    };
    if local_path != "/api" && !local_path.starts_with("/api/") {
        return plain(StatusCode::NOT_FOUND, "not found");
    }
    if hub_id.is_empty() {
        return plain(StatusCode::BAD_REQUEST, "missing hub id");
    }
    if !is_valid_hub_id(hub_id) {
        return plain(StatusCode::BAD_REQUEST, "invalid hub id");
    }

    let identity = match authorize(
        state.verifier.as_ref(),
        &state.policy,
        &parts.headers,
        &parts.uri,
        hub_id,
    )
    .await
    {
        Ok(identity) => identity,
        Err(AuthRejection::Unauthorized) => {
            debug!(hub_id = %hub_id, path = %local_path, "rejecting unauthenticated call");
            return plain(StatusCode::UNAUTHORIZED, "unauthorized");
        }
        Err(AuthRejection::Forbidden(reason)) => {
            warn!(hub_id = %hub_id, reason = %reason, "rejecting cross-hub call");
            return plain(StatusCode::FORBIDDEN, "forbidden");
        }
    };

    let body_b64 =
        match read_body(&parts.method, &parts.headers, body, state.config.max_body_bytes).await {
            Ok(b) => b,
            Err(resp) => return resp,
        };

    let request = HttpRequest {
        method: parts.method.to_string(),
        path: local_path.to_string(),
        query: parts
            .uri
            .query()
            .map(|q| format!("?{q}"))
            .unwrap_or_default(),
        headers: normalize_headers(&parts.headers),
        body_b64,
    };

    match state
        .correlation
        .request_http(hub_id, request, state.config.http_timeout)
        .await
    {
        Ok((key, reply)) => {
            info!(
                hub_id = %hub_id,
                key = %key,
                owner = %identity.owner_id,
                method = %parts.method,
                path = %local_path,
                status = reply.status,
                "tunneled http call"
            );
            replay(hub_id, local_path, reply)
        }
        Err(e) => {
            warn!(hub_id = %hub_id, path = %local_path, error = %e, "hub unreachable");
            hub_unreachable()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::ProxyConfig;
    use crate::server::router;
    use crate::test_support::{test_state, FakeHub, TOKEN_H1};
    use route_core::Envelope;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn call(method: &str, uri: &str, token: Option<&str>, body: &'static str) -> Request {
        let mut builder = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("host", "edge.example")
            .header("x-trace", "t1");
        if let Some(t) = token {
            builder = builder.header("authorization", format!("Bearer {t}"));
        }
        builder.body(Body::from(body)).unwrap()
    }

    #[test]
    fn hub_path_splitting() {
        assert_eq!(split_hub_path("/hubs/h1/api/x"), Some(("h1", "/api/x")));
        assert_eq!(split_hub_path("/hubs/h1"), Some(("h1", "")));
        assert_eq!(split_hub_path("/hubs//api"), Some(("", "/api")));
        assert_eq!(split_hub_path("/other/h1"), None);
    }

    #[test]
    fn header_normalization() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("edge"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("sec-websocket-key", HeaderValue::from_static("k"));
        headers.insert("Content-Type", HeaderValue::from_static("text/plain"));
        headers.append("accept", HeaderValue::from_static("a/b"));
        headers.append("accept", HeaderValue::from_static("c/d"));
        let out = normalize_headers(&headers);
        assert_eq!(out.len(), 2);
        assert_eq!(out["content-type"], "text/plain");
        assert_eq!(out["accept"], "a/b, c/d");
    }

    #[tokio::test]
    async fn round_trip_post() {
        let bus = MemoryBus::default();
        let mut hub = FakeHub::attach(&bus).await;
        let app = router(test_state(ProxyConfig::default(), &bus));

        let pending = tokio::spawn(app.oneshot(call(
            "POST",
            "/hubs/h1/api/items?a=1",
            Some(TOKEN_H1),
            "payload",
        )));

        let (key, env) = hub.recv().await;
        assert_eq!(key.hub_id(), "h1");
        assert!(key.as_str().starts_with("h1--http--"));
        let Envelope::Http(req) = env else {
            panic!("expected http envelope");
        };
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/api/items");
        assert_eq!(req.query, "?a=1");
        assert!(!req.headers.contains_key("host"));
        assert_eq!(req.headers["x-trace"], "t1");
        assert_eq!(B64.decode(req.body_b64.unwrap()).unwrap(), b"payload");

        let mut headers = EnvelopeHeaders::new();
        headers.insert("content-type".into(), "application/json".into());
        headers.insert("transfer-encoding".into(), "chunked".into());
        headers.insert("connection".into(), "close".into());
        hub.send(
            &key,
            &Envelope::HttpResp(HttpReply {
                status: 201,
                headers,
                body_b64: Some(B64.encode(br#"{"ok":true}"#)),
                truncated: true,
                err: Some("x".repeat(300)),
            }),
        )
        .await;

        let resp = pending.await.unwrap().unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let h = resp.headers();
        assert_eq!(h["content-type"], "application/json");
        assert!(h.get("transfer-encoding").is_none());
        assert!(h.get("connection").is_none());
        assert_eq!(h[PROXY_TRUNCATED_HEADER], "1");
        assert_eq!(h[PROXY_ERROR_HEADER].len(), MAX_ERROR_HEADER_CHARS);
        assert_eq!(body_text(resp).await, r#"{"ok":true}"#);
        assert_eq!(bus.subscription_count(), 1);
    }

    #[tokio::test]
    async fn get_has_null_body() {
        let bus = MemoryBus::default();
        let mut hub = FakeHub::attach(&bus).await;
        let app = router(test_state(ProxyConfig::default(), &bus));

        let pending = tokio::spawn(app.oneshot(call(
            "GET",
            "/hubs/h1/api/status?token=ignored",
            Some(TOKEN_H1),
            "",
        )));
        let (key, env) = hub.recv().await;
        let Envelope::Http(req) = env else {
            panic!("expected http envelope");
        };
        assert!(req.body_b64.is_none());
        assert_eq!(req.query, "?token=ignored");

        hub.send(
            &key,
            &Envelope::HttpResp(HttpReply {
                status: 200,
                headers: EnvelopeHeaders::new(),
                body_b64: None,
                truncated: false,
                err: None,
            }),
        )
        .await;
        let resp = pending.await.unwrap().unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get(PROXY_TRUNCATED_HEADER).is_none());
        assert!(resp.headers().get(PROXY_ERROR_HEADER).is_none());
    }

    #[tokio::test]
    async fn unauthenticated_and_bad_paths() {
        let bus = MemoryBus::default();
        let app = router(test_state(ProxyConfig::default(), &bus));

        let resp = app
            .clone()
            .oneshot(call("GET", "/hubs/h1/api/x", None, ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .clone()
            .oneshot(call("GET", "/hubs/h1/api/x", Some("bogus"), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .clone()
            .oneshot(call("GET", "/hubs//api/x", Some(TOKEN_H1), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(call("GET", "/hubs/h1/other", Some(TOKEN_H1), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn strict_policy_forbids_before_bus() {
        let bus = MemoryBus::default();
        let config = ProxyConfig {
            allow_cross_hub: false,
            ..ProxyConfig::default()
        };
        let mut hub = FakeHub::attach(&bus).await;
        let app = router(test_state(config, &bus));

        let resp = app
            .clone()
            .oneshot(call("GET", "/hubs/h2/api/x", Some(TOKEN_H1), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(hub.try_recv().is_none());
    }

    #[tokio::test]
    async fn permissive_policy_allows_cross_hub() {
        let bus = MemoryBus::default();
        let mut hub = FakeHub::attach(&bus).await;
        let app = router(test_state(ProxyConfig::default(), &bus));

        let pending = tokio::spawn(app.oneshot(call("GET", "/hubs/h2/api/x", Some(TOKEN_H1), "")));
        let (key, _) = hub.recv().await;
        assert_eq!(key.hub_id(), "h2");
        hub.send(
            &key,
            &Envelope::HttpResp(HttpReply {
                status: 204,
                headers: EnvelopeHeaders::new(),
                body_b64: None,
                truncated: false,
                err: None,
            }),
        )
        .await;
        assert_eq!(
            pending.await.unwrap().unwrap().status(),
            StatusCode::NO_CONTENT
        );
    }

    #[tokio::test]
    async fn timeout_is_bad_gateway_and_releases_subscription() {
        let bus = MemoryBus::default();
        let config = ProxyConfig {
            http_timeout: Duration::from_millis(50),
            ..ProxyConfig::default()
        };
        let app = router(test_state(config, &bus));
        let baseline = bus.subscription_count();

        let resp = app
            .oneshot(call("GET", "/hubs/h1/api/slow", Some(TOKEN_H1), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_text(resp).await, "hub unreachable");
        assert_eq!(bus.subscription_count(), baseline);
    }

    #[tokio::test]
    async fn bus_outage_is_bad_gateway() {
        let bus = MemoryBus::default();
        bus.set_offline(true);
        let app = router(test_state(ProxyConfig::default(), &bus));
        let resp = app
            .oneshot(call("GET", "/hubs/h1/api/x", Some(TOKEN_H1), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_text(resp).await, "hub unreachable");
    }

    #[tokio::test]
    async fn oversized_body_rejected() {
        let bus = MemoryBus::default();
        let config = ProxyConfig {
            max_body_bytes: 4,
            ..ProxyConfig::default()
        };
        let app = router(test_state(config, &bus));
        let resp = app
            .oneshot(call("PUT", "/hubs/h1/api/x", Some(TOKEN_H1), "too long"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn invalid_reply_status_is_bad_gateway() {
        let resp = replay(
            "h1",
            "/api/x",
            HttpReply {
                status: 42,
                headers: EnvelopeHeaders::new(),
                body_b64: None,
                truncated: false,
                err: None,
            },
        );
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
