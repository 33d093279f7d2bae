//! Route policy: which hubs a caller may reach and how many
//! tunnels and hub links may be open at once.
//!
//! The policy layer is split into two types:
//!
//! - [`RoutePolicy`]: a plain configuration struct holding the rules.
//! - [`RoutePolicyEnforcer`]: the runtime counterpart that owns the policy
//!   plus atomic counters, performing all access-control checks.

use route_core::Identity;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Static route access-control configuration.
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    /// When `false`, a caller may only reach the hub whose id equals its
    /// `owner_id`.
    pub allow_cross_hub: bool,
    /// Maximum number of concurrent WebSocket tunnels.
    pub max_tunnels: usize,
    /// Maximum number of concurrent hub links.
    pub max_links: usize,
}

/// Default policy: cross-hub access allowed, 1024 tunnels, 256 hub links.
impl Default for RoutePolicy {
    fn default() -> Self {
        Self {
            allow_cross_hub: true,
            max_tunnels: 1024,
            max_links: 256,
        }
    }
}

/// Runtime policy enforcer with atomic tunnel/link tracking.
pub struct RoutePolicyEnforcer {
    policy: RoutePolicy,
    active_tunnels: Arc<AtomicUsize>,
    active_links: Arc<AtomicUsize>,
}

impl RoutePolicyEnforcer {
    pub fn new(policy: RoutePolicy) -> Self {
        Self {
            policy,
            active_tunnels: Arc::new(AtomicUsize::new(0)),
            active_links: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Check whether `identity` may reach `hub_id`.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` when cross-hub access is disabled and the
    /// caller's owner id differs from the hub id.
    pub fn check_hub_access(&self, identity: &Identity, hub_id: &str) -> Result<(), String> {
        if self.policy.allow_cross_hub || identity.owner_id == hub_id {
            return Ok(());
        }
        Err(format!(
            "owner {} may not access hub {}",
            identity.owner_id, hub_id
        ))
    }

    /// Reserve a tunnel slot. The slot is released when the guard drops.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` when `max_tunnels` tunnels are already open.
    pub fn acquire_tunnel(&self) -> Result<ConnectionGuard, String> {
        acquire(&self.active_tunnels, self.policy.max_tunnels, "tunnel")
    }

    /// Reserve a hub link slot. The slot is released when the guard drops.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` when `max_links` links are already open.
    pub fn acquire_link(&self) -> Result<ConnectionGuard, String> {
        acquire(&self.active_links, self.policy.max_links, "hub link")
    }

    /// Current number of open tunnels. Approximate under concurrency;
    /// suitable for health output, not for synchronisation.
    pub fn active_tunnels(&self) -> usize {
        self.active_tunnels.load(Ordering::Relaxed)
    }

    /// Current number of attached hub links.
    pub fn active_links(&self) -> usize {
        self.active_links.load(Ordering::Relaxed)
    }
}

fn acquire(counter: &Arc<AtomicUsize>, max: usize, what: &str) -> Result<ConnectionGuard, String> {
    let prev = counter.fetch_add(1, Ordering::AcqRel);
    if prev >= max {
        counter.fetch_sub(1, Ordering::AcqRel);
        return Err(format!("{what} limit reached ({prev}/{max})"));
    }
    Ok(ConnectionGuard {
        counter: counter.clone(),
    })
}

/// RAII guard that decrements its counter on drop.
/// Owns an `Arc<AtomicUsize>` so it is `Send` and can be moved into spawned tasks.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
