//! Single-shot request/reply over a private subject pair.

use super::publish_envelope;
use crate::bus::Bus;
use route_core::{
    subjects_for, CorrelationKey, Envelope, HttpReply, HttpRequest, RouteError, RouteResult,
    SubjectPair,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Brokers request/reply exchanges with a hub.
///
/// Every call owns its subscription; it is released when the call returns,
/// whether it resolved, timed out, or failed.
pub struct CorrelationManager {
    bus: Arc<dyn Bus>,
    verbose: bool,
}

impl CorrelationManager {
    pub fn new(bus: Arc<dyn Bus>, verbose: bool) -> Self {
        Self { bus, verbose }
    }

    /// Publish `envelope` on `pair.to_hub` and wait on `pair.to_browser`
    /// for the first envelope `accept` maps to an answer.
    ///
    /// Envelopes that fail to decode or that `accept` rejects are logged and
    /// skipped; the wait continues until `timeout`.
    pub async fn request<T, F>(
        &self,
        pair: &SubjectPair,
        envelope: &Envelope,
        timeout: Duration,
        mut accept: F,
    ) -> RouteResult<T>
    where
        F: FnMut(Envelope) -> Option<T>,
    {
        // Subscribe before publishing so a fast reply cannot slip past.
        let mut sub = self.bus.subscribe(&pair.to_browser).await?;
        publish_envelope(self.bus.as_ref(), &pair.to_hub, envelope, self.verbose).await?;

        let verbose = self.verbose;
        let wait = async {
            while let Some(msg) = sub.next().await {
                let env = match Envelope::decode(&msg.payload) {
                    Ok(env) => env,
                    Err(e) => {
                        warn!(subject = %msg.subject, error = %e, "ignoring malformed reply envelope");
                        continue;
                    }
                };
                let kind = env.type_name();
                if verbose {
                    debug!(subject = %msg.subject, kind, "← envelope");
                }
                match accept(env) {
                    Some(answer) => return Ok(answer),
                    None => {
                        warn!(subject = %msg.subject, kind, "ignoring unexpected reply envelope");
                    }
                }
            }
            Err(RouteError::Bus("reply subscription closed".into()))
        };

        let outcome = tokio::time::timeout(timeout, wait).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                debug!(subject = %sub.subject(), ?timeout, "no reply before deadline");
                Err(RouteError::Timeout)
            }
        };
        drop(sub);
        result
    }

    /// Tunnel one HTTP request to `hub_id` and wait for its `http_resp`.
    pub async fn request_http(
        &self,
        hub_id: &str,
        request: HttpRequest,
        timeout: Duration,
    ) -> RouteResult<(CorrelationKey, HttpReply)> {
        let key = CorrelationKey::for_http(hub_id);
        let pair = subjects_for(&key);
        let reply = self
            .request(&pair, &Envelope::Http(request), timeout, |env| match env {
                Envelope::HttpResp(reply) => Some(reply),
                _ => None,
            })
            .await?;
        Ok((key, reply))
    }
}
