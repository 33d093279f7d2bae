//! Tunnels carrying HTTP calls and WebSocket sessions to hubs over the bus.
//!
//! # Submodule Architecture
//!
//! - **[`policy`]**: [`RoutePolicy`](policy::RoutePolicy) and its enforcer:
//!   cross-hub access checks plus tunnel/link slot accounting.
//! - **[`correlation`]**: the [`CorrelationManager`]: one private
//!   subscription per call, publish, then wait for the first qualifying
//!   reply or the deadline.
//! - **[`http`]**: `ANY /hubs/:hubId/api/*`: request → `http` envelope →
//!   `http_resp` → response.
//! - **[`upgrade`]**: middleware that sees every upgrade request first and
//!   claims `/hubs/:hubId/ws` and `/hubs/:hubId/yws/<room>`.
//! - **[`ws`]**: one task per tunnel session relaying frames both ways,
//!   with chunking/reassembly for oversized frames.
//!
//! # Data Flow
//!
//! ```text
//! HTTP call
//!   → http::handle_http
//!     → auth::authorize
//!     → CorrelationManager::request_http
//!         → subscribe route.to_browser.<key>
//!         → publish  route.to_hub.<key>   (http)
//!         ← first http_resp with a status, or timeout → 502
//!
//! WebSocket upgrade
//!   → upgrade::intercept
//!     → auth::authorize           (401 before the handshake on failure)
//!     → ws::run_session
//!         → subscribe route.to_browser.<key>, publish open
//!         ⇄ uplink (client → frame/chunk) / downlink (frame/chunk/close → client)
//! ```

pub mod correlation;
pub mod http;
pub mod policy;
pub mod upgrade;
pub mod ws;

pub use correlation::CorrelationManager;

use crate::bus::Bus;
use route_core::{Envelope, RouteResult};
use tracing::debug;

/// Encode and publish one envelope.
pub(crate) async fn publish_envelope(
    bus: &dyn Bus,
    subject: &str,
    envelope: &Envelope,
    verbose: bool,
) -> RouteResult<()> {
    let payload = envelope.encode()?;
    if verbose {
        debug!(
            subject = %subject,
            kind = envelope.type_name(),
            bytes = payload.len(),
            "→ envelope"
        );
    }
    bus.publish(subject, payload).await
}

/// Keep at most `max` characters of a hub-supplied message.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Keep at most `max` bytes of `s`, cut on a character boundary.
pub(crate) fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_helpers() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("ab", 10), "ab");
        assert_eq!(truncate_bytes("héllo", 2), "h");
        assert_eq!(truncate_bytes("héllo", 3), "hé");
        assert_eq!(truncate_bytes("abc", 10), "abc");
    }
}
