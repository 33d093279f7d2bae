//! Envelopes carried on the route subjects.
//!
//! Every bus payload is one JSON object tagged by `type`:
//!
//! | `type`      | Direction      | Meaning                              |
//! |-------------|----------------|--------------------------------------|
//! | `http`      | proxy → hub    | Tunneled HTTP request                |
//! | `http_resp` | hub → proxy    | Reply to an `http` envelope          |
//! | `open`      | proxy → hub    | WebSocket tunnel session start       |
//! | `frame`     | both           | One complete WebSocket frame         |
//! | `chunk`     | both           | One slice of an oversized frame      |
//! | `close`     | both           | WebSocket tunnel session end         |

use crate::error::{RouteError, RouteResult};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Normalized header map (lower-cased names, multi-values joined by `", "`).
pub type HeaderMap = BTreeMap<String, String>;

/// A bus envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Http(HttpRequest),
    HttpResp(HttpReply),
    Open(OpenSession),
    Frame(Frame),
    Chunk(Chunk),
    Close(CloseSession),
}

impl Envelope {
    /// Decode an envelope from raw bus bytes.
    pub fn decode(data: &[u8]) -> RouteResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Encode this envelope as JSON bytes for publishing.
    pub fn encode(&self) -> RouteResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// The wire `type` tag, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::Http(_) => "http",
            Envelope::HttpResp(_) => "http_resp",
            Envelope::Open(_) => "open",
            Envelope::Frame(_) => "frame",
            Envelope::Chunk(_) => "chunk",
            Envelope::Close(_) => "close",
        }
    }
}

/// Tunneled HTTP request (`type: "http"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    /// Hub-local path, with the `/hubs/<hub_id>` prefix stripped.
    pub path: String,
    /// Raw query string including the leading `?`, or empty.
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub headers: HeaderMap,
    /// Base64 body; `null` when the request carries no body.
    #[serde(default)]
    pub body_b64: Option<String>,
}

/// Reply to a tunneled HTTP request (`type: "http_resp"`).
///
/// `status` has no default: an `http_resp` without it does not decode and
/// is never taken as an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpReply {
    pub status: u16,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(default)]
    pub body_b64: Option<String>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl HttpReply {
    /// Decode the reply body. A missing body decodes as empty.
    pub fn body(&self) -> RouteResult<Vec<u8>> {
        match &self.body_b64 {
            Some(b) => Ok(B64.decode(b)?),
            None => Ok(Vec::new()),
        }
    }
}

/// WebSocket tunnel session start (`type: "open"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenSession {
    pub proto: String,
    pub path: String,
    #[serde(default)]
    pub query: String,
}

/// WebSocket tunnel session end (`type: "close"`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloseSession {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

/// WebSocket frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Bin,
    Text,
}

/// Decoded frame content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Binary(Vec<u8>),
    Text(String),
}

impl Payload {
    pub fn kind(&self) -> FrameKind {
        match self {
            Payload::Binary(_) => FrameKind::Bin,
            Payload::Text(_) => FrameKind::Text,
        }
    }

    /// Raw payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Payload::Binary(b) => b.len(),
            Payload::Text(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wire encoding shared by `frame` and `chunk`: base64 for binary, raw
/// string for text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl WireData {
    fn encode(payload: &Payload) -> Self {
        match payload {
            Payload::Binary(b) => Self {
                data_b64: Some(B64.encode(b)),
                data: None,
            },
            Payload::Text(s) => Self {
                data_b64: None,
                data: Some(s.clone()),
            },
        }
    }

    fn decode(&self, kind: FrameKind) -> RouteResult<Payload> {
        match (kind, &self.data_b64, &self.data) {
            (FrameKind::Bin, Some(b), _) => Ok(Payload::Binary(B64.decode(b)?)),
            (FrameKind::Text, _, Some(s)) => Ok(Payload::Text(s.clone())),
            (FrameKind::Bin, None, _) => Err(RouteError::InvalidEnvelope(
                "bin payload without data_b64".into(),
            )),
            (FrameKind::Text, _, None) => Err(RouteError::InvalidEnvelope(
                "text payload without data".into(),
            )),
        }
    }
}

/// One complete WebSocket frame (`type: "frame"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    #[serde(flatten)]
    pub wire: WireData,
}

impl Frame {
    pub fn new(payload: &Payload) -> Self {
        Self {
            kind: payload.kind(),
            wire: WireData::encode(payload),
        }
    }

    /// Decode the payload, checking it matches `kind`.
    pub fn payload(&self) -> RouteResult<Payload> {
        self.wire.decode(self.kind)
    }
}

/// One slice of an oversized WebSocket frame (`type: "chunk"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Fragment id shared by every chunk of one frame.
    pub id: String,
    pub kind: FrameKind,
    pub idx: usize,
    pub total: usize,
    #[serde(flatten)]
    pub wire: WireData,
}

impl Chunk {
    pub fn new(id: &str, idx: usize, total: usize, part: &Payload) -> Self {
        Self {
            id: id.to_string(),
            kind: part.kind(),
            idx,
            total,
            wire: WireData::encode(part),
        }
    }

    /// Decode this slice, checking it matches `kind`.
    pub fn part(&self) -> RouteResult<Payload> {
        self.wire.decode(self.kind)
    }
}
