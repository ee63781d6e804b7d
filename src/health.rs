//! Periodic health checking of backend targets.
//!
//! A single background task ticks on a uniform short interval. On each
//! tick it walks every group with health checks enabled and probes the
//! targets whose configured interval has elapsed. The last-probe timestamp is stamped
//! before the probe is issued so concurrent ticks cannot double-fire.
//! Probes run as their own tasks so one hung target cannot stall the tick.
//!
//! Threshold arithmetic: a probe answered with HTTP 200 counts as a
//! success, anything else (including transport errors) as a failure.
//! `successThreshold` consecutive successes bring an unhealthy target
//! back (logged at INFO); `failureThreshold` consecutive failures
//! quarantine a healthy one (logged at WARN). All targets start healthy
//! so requests can flow immediately.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::StatusCode;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HealthCheckPolicy;
use crate::target::{Target, TargetGroupRegistry};

/// How often the scheduler wakes up to evaluate per-target intervals.
/// Short enough to honor sub-second per-group intervals.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Cap on a single probe exchange.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

type ProbeClient = Client<HttpConnector, Empty<Bytes>>;

/// Spawns the health-check scheduler over all registered groups.
///
/// Groups without an enabled health check are never probed. The scheduler
/// borrows targets through the registry and only touches their atomic
/// state; request handling observes transitions via the healthy-list
/// filter.
pub fn spawn_health_checker(registry: Arc<TargetGroupRegistry>) -> JoinHandle<()> {
    let client: ProbeClient =
        Client::builder(TokioExecutor::new()).build(HttpConnector::new());

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let now = now_millis();

            for group in registry.groups() {
                let Some(policy) = group.health_check().filter(|hc| hc.enabled) else {
                    continue;
                };

                for target in group.targets() {
                    let elapsed = now.saturating_sub(target.last_health_check_ms());
                    if elapsed < policy.interval.as_millis() as u64 {
                        continue;
                    }
                    target.set_last_health_check_ms(now);

                    let client = client.clone();
                    let target = Arc::clone(target);
                    let policy = policy.clone();
                    let group_name = group.name().to_owned();
                    tokio::spawn(async move {
                        probe(&client, &target, &policy, &group_name).await;
                    });
                }
            }
        }
    })
}

/// Issues one probe and applies its outcome to the target's health state.
async fn probe(client: &ProbeClient, target: &Target, policy: &HealthCheckPolicy, group: &str) {
    let uri = match probe_uri(target, &policy.path) {
        Ok(uri) => uri,
        Err(e) => {
            warn!(group, target = %target.url(), error = %e, "failed to build probe URI");
            return;
        }
    };

    let result = tokio::time::timeout(PROBE_TIMEOUT, client.get(uri)).await;

    let ok = match result {
        Ok(Ok(response)) => {
            let status = response.status();
            if status != StatusCode::OK {
                debug!(group, target = %target.url(), status = status.as_u16(), "probe returned non-200");
            }
            status == StatusCode::OK
        }
        Ok(Err(e)) => {
            debug!(group, target = %target.url(), error = %e, "probe request failed");
            false
        }
        Err(_elapsed) => {
            debug!(group, target = %target.url(), "probe timed out");
            false
        }
    };

    apply_probe_outcome(target, policy, ok, group);
}

/// Applies threshold arithmetic for one probe result.
pub(crate) fn apply_probe_outcome(
    target: &Target,
    policy: &HealthCheckPolicy,
    ok: bool,
    group: &str,
) {
    if ok {
        let successes = target.record_probe_success();
        if successes >= policy.success_threshold && !target.is_healthy() {
            target.mark_healthy();
            info!(
                group,
                target = %target.url(),
                successes,
                "target recovered, rejoining rotation"
            );
        }
    } else {
        let failures = target.record_probe_failure();
        if failures >= policy.failure_threshold && target.is_healthy() {
            target.mark_unhealthy();
            warn!(
                group,
                target = %target.url(),
                failures,
                "target quarantined after consecutive probe failures"
            );
        }
    }
}

/// Builds the probe URI from the target origin, the target's base path,
/// and the configured health path, with exactly one `/` at the join.
fn probe_uri(target: &Target, health_path: &str) -> crate::Result<hyper::Uri> {
    let authority = target.url().authority().ok_or_else(|| {
        crate::ProxyError::InvalidTarget(format!("{}: URL has no authority", target.url()))
    })?;

    let path = join_health_path(target.url().path(), health_path);

    hyper::Uri::builder()
        .scheme("http")
        .authority(authority.clone())
        .path_and_query(path)
        .build()
        .map_err(|e| crate::ProxyError::InvalidTarget(format!("{}: {e}", target.url())))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Concatenates a base path and a health path, inserting or collapsing a
/// single `/` at the join.
fn join_health_path(base: &str, health: &str) -> String {
    let base = if base.is_empty() { "/" } else { base };

    match (base.ends_with('/'), health.starts_with('/')) {
        (true, true) => format!("{base}{}", &health[1..]),
        (false, false) => format!("{base}/{health}"),
        _ => format!("{base}{health}"),
    }
}
