//! Core server: shared state, routing, and the accept loop.
//!
//! Owns the bus handle, the session verifier, the policy enforcer and the
//! correlation manager. Every tunnel and hub link borrows them through
//! [`AppState`].

use crate::auth::SessionVerifier;
use crate::bus::{link, Bus};
use crate::config::ProxyConfig;
use crate::tunnel::policy::RoutePolicyEnforcer;
use crate::tunnel::{http, upgrade, CorrelationManager};
use axum::extract::State;
use axum::routing::{any, get};
use axum::{middleware, Json, Router};
use route_core::RouteResult;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub bus: Arc<dyn Bus>,
    pub verifier: Arc<dyn SessionVerifier>,
    pub policy: Arc<RoutePolicyEnforcer>,
    pub correlation: Arc<CorrelationManager>,
}

impl AppState {
    pub fn new(
        config: ProxyConfig,
        bus: Arc<dyn Bus>,
        verifier: Arc<dyn SessionVerifier>,
    ) -> Self {
        let policy = Arc::new(RoutePolicyEnforcer::new(config.policy()));
        let correlation = Arc::new(CorrelationManager::new(bus.clone(), config.verbose));
        Self {
            config: Arc::new(config),
            bus,
            verifier,
            policy,
            correlation,
        }
    }
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "tunnels": state.policy.active_tunnels(),
        "links": state.policy.active_links(),
    }))
}

/// Build the router. The upgrade interceptor wraps the `/hubs/` route so it
/// sees tunnel upgrades before the HTTP tunnel handler does.
pub fn router(state: AppState) -> Router {
    let hubs = Router::new()
        .route("/hubs/*tail", any(http::handle_http))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            upgrade::intercept,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/bus/link", get(link::handle_link))
        .merge(hubs)
        .with_state(state)
}

/// The route proxy instance.
pub struct RouteProxy {
    state: AppState,
}

impl RouteProxy {
    pub fn new(
        config: ProxyConfig,
        bus: Arc<dyn Bus>,
        verifier: Arc<dyn SessionVerifier>,
    ) -> Self {
        Self {
            state: AppState::new(config, bus, verifier),
        }
    }

    /// Connect to the bus, bind the configured address and serve until the
    /// listener fails.
    pub async fn run(&self) -> RouteResult<()> {
        self.state.bus.connect().await?;
        let listener = TcpListener::bind(self.state.config.bind).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> RouteResult<()> {
        info!(
            addr = %listener.local_addr()?,
            allow_cross_hub = self.state.config.allow_cross_hub,
            chunk_size = self.state.config.chunk_size,
            "route proxy listening"
        );
        axum::serve(listener, router(self.state.clone())).await?;
        Ok(())
    }
}
