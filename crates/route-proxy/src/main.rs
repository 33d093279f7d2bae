//! route-proxy: edge route proxy.
//!
//! Authenticates browser traffic for `/hubs/:hubId/...` and tunnels it to the
//! addressed hub over a pub/sub bus: HTTP as request/reply envelopes,
//! WebSocket sessions as framed, chunked relays. Hubs attach to the bus from
//! behind NAT through `/bus/link`.

mod auth;
mod bus;
mod config;
mod server;
#[cfg(test)]
mod test_support;
mod tunnel;

use auth::TokenVerifier;
use bus::MemoryBus;
use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};
use config::{Overrides, ProxyConfig};
use route_core::{create_token, Identity, Role};
use server::RouteProxy;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// route-proxy: tunnel browser traffic to private hubs
#[derive(Parser, Debug)]
#[command(name = "route-proxy", version, about = "Hub route proxy")]
struct Cli {
    /// Config file path
    #[arg(long, env = "ROUTE_CONFIG", default_value = "~/.adaos/route-proxy.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(flatten)]
    overrides: OverrideArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug)]
struct OverrideArgs {
    /// Listen address
    #[arg(long, env = "ROUTE_BIND")]
    bind: Option<SocketAddr>,

    /// Let any authenticated caller reach any hub
    #[arg(long, env = "ROUTE_ALLOW_CROSS_HUB", value_parser = BoolishValueParser::new())]
    allow_cross_hub: Option<bool>,

    /// Log every envelope at debug level
    #[arg(long, env = "ROUTE_VERBOSE", value_parser = BoolishValueParser::new())]
    verbose: Option<bool>,

    /// Largest WebSocket payload sent as a single frame, in bytes
    #[arg(long, env = "ROUTE_CHUNK_SIZE")]
    chunk_size: Option<usize>,

    /// How long an HTTP call waits for the hub, in milliseconds
    #[arg(long, env = "ROUTE_HTTP_TIMEOUT_MS")]
    http_timeout_ms: Option<u64>,

    /// Hex secret for signed session tokens
    #[arg(long, env = "ROUTE_TOKEN_SECRET", hide_env_values = true)]
    token_secret: Option<String>,
}

impl From<OverrideArgs> for Overrides {
    fn from(args: OverrideArgs) -> Self {
        Self {
            bind: args.bind,
            allow_cross_hub: args.allow_cross_hub,
            verbose: args.verbose,
            chunk_size: args.chunk_size,
            http_timeout_ms: args.http_timeout_ms,
            token_secret: args.token_secret,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy (the default)
    Serve,
    /// Mint a signed session token and print it
    Token {
        /// Owner id; for a hub link this is the hub id
        #[arg(long)]
        owner: String,
        /// Mint a hub credential for `/bus/link` instead of a browser session
        #[arg(long, conflicts_with_all = ["browser_key", "sid"])]
        hub: bool,
        /// Browser key id to embed
        #[arg(long)]
        browser_key: Option<String>,
        /// Session id to embed
        #[arg(long)]
        sid: Option<String>,
        /// Lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let overrides = Overrides::from(cli.overrides);
    let config = match ProxyConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Token {
            owner,
            hub,
            browser_key,
            sid,
            ttl,
        } => {
            let Some(secret) = config.token_secret else {
                error!("no token_secret configured; set [auth] token_secret or ROUTE_TOKEN_SECRET");
                std::process::exit(1);
            };
            let identity = Identity {
                owner_id: owner,
                browser_key_id: browser_key,
                sid,
                role: if hub { Role::Hub } else { Role::Browser },
            };
            match create_token(&secret, &identity, ttl) {
                Ok(token) => println!("{token}"),
                Err(e) => {
                    error!(error = %e, "failed to mint token");
                    std::process::exit(1);
                }
            }
        }
    }
}

async fn serve(config: ProxyConfig) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.bind,
        "starting route-proxy"
    );
    if config.token_secret.is_none() && config.sessions.is_empty() {
        warn!("no token_secret and no sessions configured; every caller will be rejected");
    }

    let bus = Arc::new(MemoryBus::new(config.bus_max_payload));
    let verifier = Arc::new(TokenVerifier::new(
        config.token_secret.clone(),
        config.sessions.clone(),
    ));
    let proxy = RouteProxy::new(config, bus, verifier);

    tokio::select! {
        result = proxy.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("route-proxy stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
