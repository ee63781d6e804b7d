//! Per-backend runtime state, target groups, and the startup registry.
//!
//! Each backend is represented by a [`Target`] holding its URI, weight, and
//! atomic health state. Health transitions are lock-free: the healthy flag
//! is an [`AtomicBool`] and the consecutive success/failure counters are
//! [`AtomicU32`]s. Incrementing one counter zeroes the other; the pair of
//! operations is not atomic as a whole, which is tolerated because the
//! health-check thresholds eventually drive the flag to the correct state.
//!
//! [`TargetGroupRegistry::from_config`] builds the runtime tree from
//! validated configuration, resolving each hostname to its IPv4 addresses
//! and creating one [`Target`] per address.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use tracing::{info, warn};

use crate::balancer::AlgorithmKind;
use crate::config::{HealthCheckPolicy, RuntimeConfig, ValidatedGroup, ValidatedTarget};
use crate::{ProxyError, Result};

/// Runtime state for a single backend target.
///
/// Created once at startup and shared as `Arc<Target>` between the router,
/// the selection algorithms, and the health-check scheduler. All mutable
/// fields are individually atomic; the struct itself is never mutated
/// structurally after construction.
#[derive(Debug)]
pub struct Target {
    url: hyper::Uri,
    weight: u32,
    healthy: AtomicBool,
    active_connections: AtomicUsize,
    consecutive_successes: AtomicU32,
    consecutive_failures: AtomicU32,
    last_health_check_ms: AtomicU64,
}

impl Target {
    /// Creates a new target, initially healthy with no active connections.
    pub fn new(url: hyper::Uri, weight: u32) -> Self {
        Self {
            url,
            weight,
            healthy: AtomicBool::new(true),
            active_connections: AtomicUsize::new(0),
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_health_check_ms: AtomicU64::new(0),
        }
    }

    /// Returns the upstream URI.
    pub fn url(&self) -> &hyper::Uri {
        &self.url
    }

    /// Returns the load-balancing weight.
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Returns `true` if this target is currently considered healthy.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Marks this target healthy.
    pub fn mark_healthy(&self) {
        self.healthy.store(true, Ordering::Release);
    }

    /// Marks this target unhealthy.
    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
    }

    /// Returns the current number of in-flight upstream attempts.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Increments the in-flight attempt counter. Every increment must be
    /// paired with exactly one [`Target::dec_connections`] on completion.
    pub fn inc_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the in-flight attempt counter.
    pub fn dec_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::AcqRel);
    }

    /// Records a successful health probe, zeroing the failure counter.
    /// Returns the new consecutive success count.
    pub fn record_probe_success(&self) -> u32 {
        let successes = self
            .consecutive_successes
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        self.consecutive_failures.store(0, Ordering::Release);
        successes
    }

    /// Records a failed health probe, zeroing the success counter.
    /// Returns the new consecutive failure count.
    pub fn record_probe_failure(&self) -> u32 {
        let failures = self
            .consecutive_failures
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        self.consecutive_successes.store(0, Ordering::Release);
        failures
    }

    /// Returns the consecutive successful probe count.
    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Acquire)
    }

    /// Returns the consecutive failed probe count.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Returns the epoch-millisecond timestamp of the last probe issued.
    pub fn last_health_check_ms(&self) -> u64 {
        self.last_health_check_ms.load(Ordering::Acquire)
    }

    /// Stamps the last-probe timestamp. Called before the probe is issued
    /// so concurrent scheduler ticks do not double-fire.
    pub fn set_last_health_check_ms(&self, now_ms: u64) {
        self.last_health_check_ms.store(now_ms, Ordering::Release);
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (weight={}, healthy={}, active={})",
            self.url,
            self.weight,
            self.is_healthy(),
            self.active_connections()
        )
    }
}

/// A group of targets sharing a path prefix, algorithm, and optional
/// health check. Immutable after construction.
#[derive(Debug)]
pub struct TargetGroup {
    name: String,
    path_prefix: String,
    algorithm: AlgorithmKind,
    path_rewrite: Option<String>,
    health_check: Option<HealthCheckPolicy>,
    targets: Vec<Arc<Target>>,
}

impl TargetGroup {
    /// Creates a group from its parts. `targets` must be non-empty; this is
    /// enforced by configuration validation.
    pub fn new(
        name: String,
        path_prefix: String,
        algorithm: AlgorithmKind,
        path_rewrite: Option<String>,
        health_check: Option<HealthCheckPolicy>,
        targets: Vec<Arc<Target>>,
    ) -> Self {
        Self {
            name,
            path_prefix,
            algorithm,
            path_rewrite,
            health_check,
            targets,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the request path prefix routed to this group.
    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    /// Returns the algorithm bound to this group.
    pub fn algorithm(&self) -> AlgorithmKind {
        self.algorithm
    }

    /// Returns the prefix stripped from request paths before forwarding.
    pub fn path_rewrite(&self) -> Option<&str> {
        self.path_rewrite.as_deref()
    }

    pub fn health_check(&self) -> Option<&HealthCheckPolicy> {
        self.health_check.as_ref()
    }

    /// Returns all targets, healthy or not, in configuration order.
    pub fn targets(&self) -> &[Arc<Target>] {
        &self.targets
    }

    /// Returns the targets currently marked healthy, preserving order.
    pub fn healthy_targets(&self) -> Vec<Arc<Target>> {
        self.targets
            .iter()
            .filter(|t| t.is_healthy())
            .cloned()
            .collect()
    }
}

/// Owns all target groups (and transitively all targets) for the lifetime
/// of the process.
#[derive(Debug)]
pub struct TargetGroupRegistry {
    groups: Vec<Arc<TargetGroup>>,
}

impl TargetGroupRegistry {
    /// Builds the registry from validated configuration, expanding each
    /// configured hostname into one target per resolved IPv4 address.
    pub async fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let mut groups = Vec::with_capacity(config.groups.len());

        for group in &config.groups {
            groups.push(Arc::new(build_group(group).await?));
        }

        Ok(Self { groups })
    }

    /// Builds a registry directly from constructed groups.
    pub fn from_groups(groups: Vec<TargetGroup>) -> Self {
        Self {
            groups: groups.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn groups(&self) -> &[Arc<TargetGroup>] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

async fn build_group(group: &ValidatedGroup) -> Result<TargetGroup> {
    let mut targets = Vec::with_capacity(group.targets.len());
    for target in &group.targets {
        targets.extend(expand_target(&group.name, target).await);
    }

    if targets.is_empty() {
        return Err(ProxyError::Config(format!(
            "target group {}: no usable targets after DNS expansion",
            group.name
        )));
    }

    info!(
        group = %group.name,
        prefix = %group.path_prefix,
        algorithm = group.algorithm.name(),
        targets = targets.len(),
        "registered target group"
    );

    Ok(TargetGroup::new(
        group.name.clone(),
        group.path_prefix.clone(),
        group.algorithm,
        group.path_rewrite.clone(),
        group.health_check.clone(),
        targets,
    ))
}

/// Resolves one configured target into its runtime targets.
///
/// Hostnames resolve to their IPv4 addresses, one target per address, with
/// the URI rebuilt around the IP. Hosts that are already IP literals, names
/// with no IPv4 addresses, and resolution failures fall back to a single
/// target with the original URL.
async fn expand_target(group: &str, target: &ValidatedTarget) -> Vec<Arc<Target>> {
    let host = match target.uri.host() {
        Some(host) => host.to_owned(),
        None => return vec![Arc::new(Target::new(target.uri.clone(), target.weight))],
    };

    if host.parse::<IpAddr>().is_ok() {
        return vec![Arc::new(Target::new(target.uri.clone(), target.weight))];
    }

    let port = target.uri.port_u16().unwrap_or(80);
    let resolved = match tokio::net::lookup_host((host.as_str(), port)).await {
        Ok(addrs) => ipv4_addresses(addrs),
        Err(e) => {
            warn!(
                group,
                url = %target.uri,
                error = %e,
                "DNS resolution failed, using configured URL"
            );
            return vec![Arc::new(Target::new(target.uri.clone(), target.weight))];
        }
    };

    if resolved.is_empty() {
        warn!(
            group,
            url = %target.uri,
            "no IPv4 addresses resolved, using configured URL"
        );
        return vec![Arc::new(Target::new(target.uri.clone(), target.weight))];
    }

    resolved
        .into_iter()
        .filter_map(|ip| match rebuild_with_ip(&target.uri, ip) {
            Ok(uri) => {
                info!(group, configured = %target.uri, resolved = %uri, "expanded target");
                Some(Arc::new(Target::new(uri, target.weight)))
            }
            Err(e) => {
                warn!(group, url = %target.uri, ip = %ip, error = %e, "failed to rebuild URL");
                None
            }
        })
        .collect()
}

/// Filters resolved socket addresses down to unique IPv4 addresses,
/// preserving resolver order.
fn ipv4_addresses(addrs: impl Iterator<Item = SocketAddr>) -> Vec<std::net::Ipv4Addr> {
    let mut seen = Vec::new();
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            if !seen.contains(v4.ip()) {
                seen.push(*v4.ip());
            }
        }
    }
    seen
}

/// Rebuilds a URI with the given IPv4 address in place of the hostname,
/// preserving scheme, port, path, and query.
fn rebuild_with_ip(uri: &hyper::Uri, ip: std::net::Ipv4Addr) -> Result<hyper::Uri> {
    let authority = match uri.port_u16() {
        Some(port) => format!("{ip}:{port}"),
        None => ip.to_string(),
    };
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    hyper::Uri::builder()
        .scheme("http")
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::InvalidTarget(format!("{uri}: {e}")))
}
