//! WebSocket tunnel sessions.
//!
//! One task per session. After `open` is published the session runs two
//! loops side by side: the uplink turns client frames into `frame`/`chunk`
//! envelopes, the downlink turns hub envelopes back into client frames. The
//! first loop to finish decides how the session ends.

use super::{publish_envelope, truncate_bytes};
use crate::bus::{Bus, Subscription};
use crate::server::AppState;
use crate::tunnel::policy::ConnectionGuard;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use route_core::{
    outbound_envelopes, subjects_for, ChunkOutcome, CloseSession, CorrelationKey, Envelope,
    Identity, OpenSession, Payload, Reassembler, RouteResult, SubjectPair,
};
use tracing::{debug, info, warn};

/// Close reasons are capped to fit a control frame.
const MAX_CLOSE_REASON_BYTES: usize = 123;

/// Where a tunnel session is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub hub_id: String,
    /// Hub-local path: `/ws` or `/yws/<room>`.
    pub path: String,
    /// Raw query including the leading `?`, or empty.
    pub query: String,
}

/// How a session ended.
#[derive(Debug)]
enum SessionEnd {
    /// The client sent a close frame.
    ClientClosed,
    /// The client socket errored or went away.
    ClientGone,
    /// The hub sent `close`.
    HubClosed(CloseFrame<'static>),
    /// Publishing to or reading from the bus failed.
    BusFailed(String),
}

/// What the downlink should do with one hub envelope.
#[derive(Debug)]
pub(crate) enum DownlinkAction {
    Forward(Message),
    Close(CloseFrame<'static>),
    Ignore,
}

/// Downlink state: the reassembly table for this session.
#[derive(Default)]
pub(crate) struct Downlink {
    reassembler: Reassembler,
}

impl Downlink {
    pub(crate) fn apply(&mut self, envelope: Envelope) -> DownlinkAction {
        match envelope {
            Envelope::Frame(frame) => match frame.payload() {
                Ok(payload) => DownlinkAction::Forward(to_message(payload)),
                Err(e) => {
                    warn!(error = %e, "dropping undecodable frame");
                    DownlinkAction::Ignore
                }
            },
            Envelope::Chunk(chunk) => {
                let id = chunk.id.clone();
                match self.reassembler.accept(chunk) {
                    ChunkOutcome::Complete(payload) => DownlinkAction::Forward(to_message(payload)),
                    ChunkOutcome::Pending => DownlinkAction::Ignore,
                    ChunkOutcome::Dropped(reason) => {
                        debug!(fragment = %id, reason, "chunk dropped");
                        DownlinkAction::Ignore
                    }
                }
            }
            Envelope::Close(close) => {
                self.reassembler.clear();
                DownlinkAction::Close(close_frame(close.err.as_deref()))
            }
            other => {
                warn!(kind = other.type_name(), "unexpected envelope on tunnel");
                DownlinkAction::Ignore
            }
        }
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.reassembler.pending()
    }
}

fn to_message(payload: Payload) -> Message {
    match payload {
        Payload::Binary(b) => Message::Binary(b),
        Payload::Text(s) => Message::Text(s),
    }
}

/// Close frame for a hub `close`: policy violation carrying the hub's
/// message when it reported one, normal closure otherwise.
pub(crate) fn close_frame(err: Option<&str>) -> CloseFrame<'static> {
    match err {
        Some(err) => CloseFrame {
            code: close_code::POLICY,
            reason: truncate_bytes(err, MAX_CLOSE_REASON_BYTES).to_string().into(),
        },
        None => CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        },
    }
}

/// Subscribe to the reply subject, then announce the session to the hub.
async fn open(
    bus: &dyn Bus,
    pair: &SubjectPair,
    target: &TunnelTarget,
    verbose: bool,
) -> RouteResult<Subscription> {
    let sub = bus.subscribe(&pair.to_browser).await?;
    let open = Envelope::Open(OpenSession {
        proto: "ws".into(),
        path: target.path.clone(),
        query: target.query.clone(),
    });
    publish_envelope(bus, &pair.to_hub, &open, verbose).await?;
    Ok(sub)
}

async fn downlink(
    sink: &mut SplitSink<WebSocket, Message>,
    sub: &mut Subscription,
    state: &mut Downlink,
    verbose: bool,
) -> SessionEnd {
    while let Some(msg) = sub.next().await {
        let envelope = match Envelope::decode(&msg.payload) {
            Ok(env) => env,
            Err(e) => {
                warn!(subject = %msg.subject, error = %e, "ignoring malformed envelope");
                continue;
            }
        };
        if verbose {
            debug!(subject = %msg.subject, kind = envelope.type_name(), "← envelope");
        }
        match state.apply(envelope) {
            DownlinkAction::Forward(message) => {
                if sink.send(message).await.is_err() {
                    return SessionEnd::ClientGone;
                }
            }
            DownlinkAction::Close(frame) => return SessionEnd::HubClosed(frame),
            DownlinkAction::Ignore => {}
        }
    }
    SessionEnd::BusFailed("reply subscription closed".into())
}

async fn uplink(
    stream: &mut SplitStream<WebSocket>,
    bus: &dyn Bus,
    to_hub: &str,
    chunk_size: usize,
    verbose: bool,
) -> SessionEnd {
    while let Some(msg) = stream.next().await {
        let payload = match msg {
            Ok(Message::Text(text)) => Payload::Text(text),
            Ok(Message::Binary(bytes)) => Payload::Binary(bytes),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return SessionEnd::ClientClosed,
            Err(e) => {
                debug!(error = %e, "client socket error");
                return SessionEnd::ClientGone;
            }
        };
        for envelope in outbound_envelopes(&payload, chunk_size) {
            if let Err(e) = publish_envelope(bus, to_hub, &envelope, verbose).await {
                return SessionEnd::BusFailed(e.to_string());
            }
        }
    }
    SessionEnd::ClientGone
}

/// Run one tunnel session to completion. `guard` holds the tunnel slot.
pub async fn run_session(
    mut socket: WebSocket,
    state: AppState,
    target: TunnelTarget,
    identity: Identity,
    guard: ConnectionGuard,
) {
    let _guard = guard;
    let key = CorrelationKey::for_ws(&target.hub_id);
    let pair = subjects_for(&key);
    let bus = state.bus.clone();
    let verbose = state.config.verbose;

    let mut sub = match open(bus.as_ref(), &pair, &target, verbose).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!(hub_id = %target.hub_id, path = %target.path, error = %e, "failed to open tunnel");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: "hub unreachable".into(),
                })))
                .await;
            return;
        }
    };

    info!(
        hub_id = %target.hub_id,
        key = %key,
        owner = %identity.owner_id,
        path = %target.path,
        "tunnel open"
    );

    let (mut sink, mut stream) = socket.split();
    let mut state_down = Downlink::default();
    let end = tokio::select! {
        end = downlink(&mut sink, &mut sub, &mut state_down, verbose) => end,
        end = uplink(&mut stream, bus.as_ref(), &pair.to_hub, state.config.chunk_size, verbose) => end,
    };
    drop(sub);
    drop(state_down);

    match end {
        SessionEnd::ClientClosed | SessionEnd::ClientGone => {
            let close = Envelope::Close(CloseSession::default());
            if let Err(e) = publish_envelope(bus.as_ref(), &pair.to_hub, &close, verbose).await {
                debug!(key = %key, error = %e, "close not delivered to hub");
            }
            let _ = sink.close().await;
            info!(key = %key, "tunnel closed by client");
        }
        SessionEnd::HubClosed(frame) => {
            let code = frame.code;
            let _ = sink.send(Message::Close(Some(frame))).await;
            let _ = sink.close().await;
            info!(key = %key, code, "tunnel closed by hub");
        }
        SessionEnd::BusFailed(reason) => {
            warn!(key = %key, error = %reason, "bus failure, closing tunnel");
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: "bus error".into(),
                })))
                .await;
            let _ = sink.close().await;
        }
    }
}
