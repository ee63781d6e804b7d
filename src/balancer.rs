//! Load-balancing algorithms and the process-wide algorithm registry.
//!
//! Four strategies select one target from a group's healthy subset:
//!
//! - `ROUND_ROBIN` — lock-free cursor over the healthy list. The cursor is
//!   shared across all groups served by the registry instance.
//! - `WEIGHTED` — weighted random draw using a thread-local RNG; no state
//!   carried between calls.
//! - `LRT` — fewest in-flight upstream attempts, first wins on ties.
//! - `STICKY` — session-id affinity with round-robin fallback. Mappings are
//!   kept in a concurrent map and evicted on lookup when stale.
//!
//! All strategies return `None` when the healthy subset is empty; the
//! pipeline maps that to 503.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use hyper::header::{COOKIE, HeaderMap};
use rand::Rng;
use tracing::debug;

use crate::target::{Target, TargetGroup};

/// Cookie checked first for a session identifier.
const SESSION_COOKIE: &str = "JSESSIONID";
/// Fallback cookie checked second.
const LB_COOKIE: &str = "LB_SESSION";

/// The configured name of a load-balancing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmKind {
    RoundRobin,
    Weighted,
    Sticky,
    LeastConnections,
}

impl AlgorithmKind {
    /// Parses a configured algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ROUND_ROBIN" => Some(Self::RoundRobin),
            "WEIGHTED" => Some(Self::Weighted),
            "STICKY" => Some(Self::Sticky),
            "LRT" => Some(Self::LeastConnections),
            _ => None,
        }
    }

    /// Returns the configuration name of this algorithm.
    pub fn name(self) -> &'static str {
        match self {
            Self::RoundRobin => "ROUND_ROBIN",
            Self::Weighted => "WEIGHTED",
            Self::Sticky => "STICKY",
            Self::LeastConnections => "LRT",
        }
    }
}

/// Owns one instance of each algorithm for the life of the process.
///
/// Selection is safe to call concurrently from any number of request
/// handlers; no algorithm takes a lock.
#[derive(Debug, Default)]
pub struct AlgorithmRegistry {
    round_robin: RoundRobin,
    weighted: Weighted,
    least_connections: LeastConnections,
    sticky: Sticky,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects a target from the group's healthy subset using the named
    /// algorithm. Returns `None` when no healthy target exists.
    pub fn select(
        &self,
        kind: AlgorithmKind,
        group: &TargetGroup,
        headers: &HeaderMap,
    ) -> Option<Arc<Target>> {
        let healthy = group.healthy_targets();
        if healthy.is_empty() {
            return None;
        }

        match kind {
            AlgorithmKind::RoundRobin => self.round_robin.select(&healthy),
            AlgorithmKind::Weighted => self.weighted.select(&healthy),
            AlgorithmKind::LeastConnections => self.least_connections.select(&healthy),
            AlgorithmKind::Sticky => self.sticky.select(&healthy, headers),
        }
    }
}

/// Round-robin selection over the healthy list.
#[derive(Debug, Default)]
struct RoundRobin {
    /// Monotonic cursor, shared across every group this instance serves.
    counter: AtomicUsize,
}

impl RoundRobin {
    fn select(&self, healthy: &[Arc<Target>]) -> Option<Arc<Target>> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        healthy.get(index).cloned()
    }
}

/// Weighted random selection proportional to target weights.
#[derive(Debug, Default)]
struct Weighted;

impl Weighted {
    fn select(&self, healthy: &[Arc<Target>]) -> Option<Arc<Target>> {
        let total: u64 = healthy.iter().map(|t| u64::from(t.weight())).sum();

        if total == 0 {
            let index = rand::thread_rng().gen_range(0..healthy.len());
            return healthy.get(index).cloned();
        }

        let draw = rand::thread_rng().gen_range(0..total);
        let mut cumulative = 0u64;
        for target in healthy {
            cumulative += u64::from(target.weight());
            if draw < cumulative {
                return Some(target.clone());
            }
        }

        healthy.last().cloned()
    }
}

/// Least in-flight attempts selection, a proxy for response time.
#[derive(Debug, Default)]
struct LeastConnections;

impl LeastConnections {
    fn select(&self, healthy: &[Arc<Target>]) -> Option<Arc<Target>> {
        healthy
            .iter()
            .min_by_key(|t| t.active_connections())
            .cloned()
    }
}

/// Sticky-session selection: requests carrying the same session id keep
/// hitting the same target while it stays healthy.
#[derive(Debug, Default)]
struct Sticky {
    sessions: DashMap<String, Arc<Target>>,
    /// Fallback cursor, independent of the registry's round-robin cursor.
    fallback: RoundRobin,
}

impl Sticky {
    fn select(&self, healthy: &[Arc<Target>], headers: &HeaderMap) -> Option<Arc<Target>> {
        let session_id = extract_session_id(headers);

        if let Some(id) = &session_id {
            if let Some(cached) = self.sessions.get(id).map(|entry| entry.value().clone()) {
                if cached.is_healthy() && healthy.iter().any(|t| Arc::ptr_eq(t, &cached)) {
                    return Some(cached);
                }
                // Stale mapping: the target left the healthy set.
                debug!(session = %id, target = %cached.url(), "evicting stale session mapping");
                self.sessions.remove(id);
            }
        }

        let selected = self.fallback.select(healthy);

        if let (Some(id), Some(target)) = (session_id, &selected) {
            self.sessions.insert(id, target.clone());
        }

        selected
    }
}

/// Extracts a session identifier from request headers: the `JSESSIONID`
/// cookie, then the `LB_SESSION` cookie, then the `X-Forwarded-For` value,
/// then the `X-Real-IP` value.
fn extract_session_id(headers: &HeaderMap) -> Option<String> {
    if let Some(cookies) = headers.get(COOKIE).and_then(|v| v.to_str().ok()) {
        if let Some(id) = cookie_value(cookies, SESSION_COOKIE) {
            return Some(id.to_owned());
        }
        if let Some(id) = cookie_value(cookies, LB_COOKIE) {
            return Some(id.to_owned());
        }
    }

    headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Extracts the value of a named cookie from a `Cookie` header string.
fn cookie_value<'a>(cookie_header: &'a str, name: &str) -> Option<&'a str> {
    cookie_header.split(';').find_map(|cookie| {
        cookie
            .trim()
            .strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('='))
    })
}
