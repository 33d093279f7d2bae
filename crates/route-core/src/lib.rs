//! route-core: shared protocol library for the hub route proxy.
//!
//! Provides the JSON envelope types carried on the bus, correlation keys and
//! subject naming, chunking/reassembly of oversized WebSocket frames, and
//! HMAC-signed session tokens.

pub mod chunk;
pub mod envelope;
pub mod error;
pub mod subject;
pub mod token;

// Re-export commonly used items at crate root.
pub use chunk::{
    max_envelope_len, outbound_envelopes, ChunkOutcome, Reassembler, DEFAULT_CHUNK_SIZE,
};
pub use envelope::{
    Chunk, CloseSession, Envelope, Frame, FrameKind, HeaderMap, HttpReply, HttpRequest,
    OpenSession, Payload,
};
pub use error::{RouteError, RouteResult};
pub use subject::{is_valid_hub_id, subjects_for, CorrelationKey, SubjectPair};
pub use token::{create_token, generate_secret, verify_token, Identity, Role};
