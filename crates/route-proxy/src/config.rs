//! Proxy configuration: TOML file + CLI/environment overrides.

use route_core::{max_envelope_len, Identity, RouteError, RouteResult, Role, DEFAULT_CHUNK_SIZE};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::bus::memory::DEFAULT_MAX_PAYLOAD;
use crate::tunnel::policy::RoutePolicy;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub route: RouteSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_tunnels")]
    pub max_tunnels: usize,
    #[serde(default = "default_max_links")]
    pub max_links: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_tunnels: default_max_tunnels(),
            max_links: default_max_links(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// `[route]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteSection {
    #[serde(default = "default_true")]
    pub allow_cross_hub: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default = "default_bus_max_payload")]
    pub bus_max_payload: usize,
}

impl Default for RouteSection {
    fn default() -> Self {
        Self {
            allow_cross_hub: true,
            verbose: false,
            chunk_size: default_chunk_size(),
            http_timeout_ms: default_http_timeout_ms(),
            bus_max_payload: default_bus_max_payload(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded HMAC secret for signed session tokens.
    #[serde(default)]
    pub token_secret: Option<String>,
    /// Static session store entries.
    #[serde(default)]
    pub sessions: Vec<SessionEntry>,
}

/// One `[[auth.sessions]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionEntry {
    pub token: String,
    pub owner_id: String,
    #[serde(default)]
    pub browser_key_id: Option<String>,
    #[serde(default)]
    pub sid: Option<String>,
    /// `hub` entries may attach over `/bus/link`.
    #[serde(default)]
    pub role: Role,
}

fn default_bind() -> String {
    "0.0.0.0:8777".to_string()
}
fn default_max_tunnels() -> usize {
    1024
}
fn default_max_links() -> usize {
    256
}
fn default_max_body_bytes() -> usize {
    512 * 1024
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_http_timeout_ms() -> u64 {
    15_000
}
fn default_bus_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}
fn default_true() -> bool {
    true
}

/// Values given on the command line or through `ROUTE_*` environment
/// variables. Each one beats the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<SocketAddr>,
    pub allow_cross_hub: Option<bool>,
    pub verbose: Option<bool>,
    pub chunk_size: Option<usize>,
    pub http_timeout_ms: Option<u64>,
    pub token_secret: Option<String>,
}

/// Resolved proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind: SocketAddr,
    pub allow_cross_hub: bool,
    /// Log every envelope at debug level.
    pub verbose: bool,
    pub chunk_size: usize,
    pub http_timeout: Duration,
    pub bus_max_payload: usize,
    pub max_tunnels: usize,
    pub max_links: usize,
    pub max_body_bytes: usize,
    pub token_secret: Option<Vec<u8>>,
    pub sessions: HashMap<String, Identity>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let route = RouteSection::default();
        let server = ServerSection::default();
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8777)),
            allow_cross_hub: route.allow_cross_hub,
            verbose: route.verbose,
            chunk_size: route.chunk_size,
            http_timeout: Duration::from_millis(route.http_timeout_ms),
            bus_max_payload: route.bus_max_payload,
            max_tunnels: server.max_tunnels,
            max_links: server.max_links,
            max_body_bytes: server.max_body_bytes,
            token_secret: None,
            sessions: HashMap::new(),
        }
    }
}

impl ProxyConfig {
    /// Load config from a TOML file, then apply overrides.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> RouteResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| RouteError::Other(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    /// Merge a parsed file with overrides and validate the result.
    pub fn resolve(file: ConfigFile, overrides: &Overrides) -> RouteResult<Self> {
        let bind = match overrides.bind {
            Some(addr) => addr,
            None => file.server.bind.parse().map_err(|e| {
                RouteError::Other(format!("invalid bind address {}: {e}", file.server.bind))
            })?,
        };

        let chunk_size = overrides.chunk_size.unwrap_or(file.route.chunk_size);
        if chunk_size == 0 {
            return Err(RouteError::Other("chunk_size must be positive".into()));
        }
        let bus_max_payload = file.route.bus_max_payload;
        if max_envelope_len(chunk_size) > bus_max_payload {
            return Err(RouteError::Other(format!(
                "chunk_size {chunk_size} does not fit the bus payload limit {bus_max_payload} once encoded"
            )));
        }
        let http_timeout_ms = overrides
            .http_timeout_ms
            .unwrap_or(file.route.http_timeout_ms);
        if http_timeout_ms == 0 {
            return Err(RouteError::Other("http_timeout_ms must be positive".into()));
        }

        let secret_hex = overrides
            .token_secret
            .clone()
            .or(file.auth.token_secret);
        let token_secret = match secret_hex {
            Some(hex_str) if !hex_str.trim().is_empty() => Some(
                hex::decode(hex_str.trim())
                    .map_err(|e| RouteError::Other(format!("token_secret is not hex: {e}")))?,
            ),
            _ => None,
        };

        let sessions = file
            .auth
            .sessions
            .into_iter()
            .map(|s| {
                (
                    s.token,
                    Identity {
                        owner_id: s.owner_id,
                        browser_key_id: s.browser_key_id,
                        sid: s.sid,
                        role: s.role,
                    },
                )
            })
            .collect();

        Ok(Self {
            bind,
            allow_cross_hub: overrides
                .allow_cross_hub
                .unwrap_or(file.route.allow_cross_hub),
            verbose: overrides.verbose.unwrap_or(file.route.verbose),
            chunk_size,
            http_timeout: Duration::from_millis(http_timeout_ms),
            bus_max_payload,
            max_tunnels: file.server.max_tunnels,
            max_links: file.server.max_links,
            max_body_bytes: file.server.max_body_bytes,
            token_secret,
            sessions,
        })
    }

    /// The access/limit rules derived from this config.
    pub fn policy(&self) -> RoutePolicy {
        RoutePolicy {
            allow_cross_hub: self.allow_cross_hub,
            max_tunnels: self.max_tunnels,
            max_links: self.max_links,
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
