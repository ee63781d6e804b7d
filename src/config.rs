//! Configuration loading, validation, and pre-validated runtime state.
//!
//! The proxy reads its YAML configuration exactly once at startup. The
//! on-disk schema lives under the `lbConfig` key and maps directly onto
//! [`Config`]. Environment variables may override the global knobs before
//! validation. [`Config::into_runtime`] then checks every field and produces
//! a [`RuntimeConfig`] holding parsed URIs, durations, and algorithm kinds
//! so the hot path never re-parses configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::balancer::AlgorithmKind;
use crate::{ProxyError, Result};

/// Default listener port when `LISTENER_PORT` is not set.
pub const DEFAULT_LISTENER_PORT: u16 = 8080;

/// On-disk wrapper: the whole tree sits under the `lbConfig` key.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(rename = "lbConfig")]
    lb_config: Config,
}

/// Raw configuration as deserialized from the YAML file.
///
/// This struct maps directly to the on-disk schema. After loading (and any
/// environment overrides), it is transformed into a [`RuntimeConfig`] that
/// holds validated URIs and parsed durations.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Default load-balancing algorithm for all target groups.
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Overall upstream request timeout in milliseconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_millis: u64,
    /// Whether the header-conventions stage runs on forwarded requests.
    #[serde(default = "default_true")]
    pub header_convention_enabled: bool,
    /// Whether failed upstream attempts are retried.
    #[serde(default)]
    pub retry_enabled: bool,
    /// Initial backoff before the first retry; doubles on each attempt.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_millis: u64,
    /// Maximum number of retries after the initial attempt.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Port the listener binds. Normally set via `LISTENER_PORT`.
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,
    /// Target groups keyed by name. Ordered for deterministic startup logs.
    pub target_groups: BTreeMap<String, TargetGroupConfig>,
}

/// Configuration for a single target group (listener rule).
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetGroupConfig {
    /// Request path prefix that routes to this group. Must start with `/`.
    pub path: String,
    /// Per-group algorithm override.
    #[serde(default)]
    pub algorithm: Option<String>,
    /// Path prefix stripped from request paths before forwarding.
    #[serde(default)]
    pub path_rewrite: Option<String>,
    /// Optional active health check for this group's targets.
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    /// Backend targets. Must be non-empty.
    pub targets: Vec<TargetConfig>,
}

/// Configuration for a single backend target.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    /// Target URL, e.g. `http://localhost:9001`.
    pub url: String,
    /// Relative weight for the WEIGHTED algorithm.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// Health check configuration as written in the config file.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Probe path relative to the target, e.g. `/healthz`.
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Milliseconds between probes of the same target.
    #[serde(default = "default_health_interval")]
    pub interval: u64,
    /// Consecutive successes required to mark an unhealthy target healthy.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Consecutive failures required to mark a healthy target unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_algorithm() -> String {
    "ROUND_ROBIN".to_owned()
}

fn default_connection_timeout() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_retry_backoff() -> u64 {
    100
}

fn default_retry_count() -> u32 {
    3
}

fn default_listener_port() -> u16 {
    DEFAULT_LISTENER_PORT
}

fn default_weight() -> u32 {
    1
}

fn default_health_path() -> String {
    "/".to_owned()
}

fn default_health_interval() -> u64 {
    5000
}

fn default_success_threshold() -> u32 {
    1
}

fn default_failure_threshold() -> u32 {
    3
}

impl Config {
    /// Loads configuration from a YAML file at the given path.
    ///
    /// Returns a [`ProxyError::Config`] if the file cannot be opened or
    /// its contents fail YAML deserialization.
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            ProxyError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        let parsed: ConfigFile = serde_yaml::from_reader(file)
            .map_err(|e| ProxyError::Config(format!("failed to parse config: {e}")))?;
        Ok(parsed.lb_config)
    }

    /// Applies recognized environment-variable overrides from the process
    /// environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from the given lookup. Unset variables leave the
    /// corresponding fields untouched; unparseable values are fatal.
    pub fn apply_overrides<F>(&mut self, get: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = get("LISTENER_PORT") {
            self.listener_port = parse_env("LISTENER_PORT", &v)?;
        }
        if let Some(v) = get("CONNECTION_TIMEOUT") {
            self.connection_timeout_millis = parse_env("CONNECTION_TIMEOUT", &v)?;
        }
        if let Some(v) = get("LOAD_BALANCING_ALGORITHM") {
            self.algorithm = v;
        }
        if let Some(v) = get("HEADER_CONVENTION_ENABLE") {
            self.header_convention_enabled = parse_env_bool("HEADER_CONVENTION_ENABLE", &v)?;
        }
        if let Some(v) = get("RETRY_ENABLE") {
            self.retry_enabled = parse_env_bool("RETRY_ENABLE", &v)?;
        }
        if let Some(v) = get("RETRY_BACKOFF") {
            self.retry_backoff_millis = parse_env("RETRY_BACKOFF", &v)?;
        }
        if let Some(v) = get("RETRY_COUNT") {
            self.retry_count = parse_env("RETRY_COUNT", &v)?;
        }
        Ok(())
    }

    /// Validates all fields, producing a [`RuntimeConfig`] suitable for the
    /// proxy hot path.
    ///
    /// Fails on an unknown algorithm name, a prefix not starting with `/`,
    /// an empty target list, a non-http or authority-less target URL, a zero
    /// weight, or out-of-range health check bounds.
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        let default_algorithm = AlgorithmKind::from_name(&self.algorithm)
            .ok_or_else(|| ProxyError::Config(format!("unknown algorithm: {}", self.algorithm)))?;

        if self.connection_timeout_millis == 0 {
            return Err(ProxyError::Config(
                "connectionTimeoutMillis must be at least 1".into(),
            ));
        }

        let mut groups = Vec::with_capacity(self.target_groups.len());
        for (name, group) in self.target_groups {
            groups.push(validate_group(&name, group, default_algorithm)?);
        }

        Ok(RuntimeConfig {
            default_algorithm,
            request_timeout: Duration::from_millis(self.connection_timeout_millis),
            connect_timeout: Duration::from_millis(self.connection_timeout_millis),
            header_convention_enabled: self.header_convention_enabled,
            retry_enabled: self.retry_enabled,
            retry_backoff: Duration::from_millis(self.retry_backoff_millis),
            retry_count: self.retry_count,
            listener_port: self.listener_port,
            groups,
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ProxyError::Config(format!("invalid value for {name}: {value:?}")))
}

fn parse_env_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ProxyError::Config(format!(
            "invalid boolean for {name}: {value:?}"
        ))),
    }
}

fn validate_group(
    name: &str,
    group: TargetGroupConfig,
    default_algorithm: AlgorithmKind,
) -> Result<ValidatedGroup> {
    if !group.path.starts_with('/') {
        return Err(ProxyError::Config(format!(
            "target group {name}: path {:?} must start with '/'",
            group.path
        )));
    }

    let algorithm = match &group.algorithm {
        Some(named) => AlgorithmKind::from_name(named).ok_or_else(|| {
            ProxyError::Config(format!("target group {name}: unknown algorithm: {named}"))
        })?,
        None => default_algorithm,
    };

    if group.targets.is_empty() {
        return Err(ProxyError::Config(format!(
            "target group {name}: must have at least one target"
        )));
    }

    let mut targets = Vec::with_capacity(group.targets.len());
    for target in &group.targets {
        targets.push(validate_target(name, target)?);
    }

    let health_check = group
        .health_check
        .map(|hc| validate_health_check(name, hc))
        .transpose()?;

    Ok(ValidatedGroup {
        name: name.to_owned(),
        path_prefix: group.path,
        algorithm,
        path_rewrite: group.path_rewrite.filter(|r| !r.is_empty()),
        health_check,
        targets,
    })
}

fn validate_target(group: &str, target: &TargetConfig) -> Result<ValidatedTarget> {
    let uri = target.url.parse::<hyper::Uri>().map_err(|e| {
        ProxyError::InvalidTarget(format!("target group {group}: {}: {e}", target.url))
    })?;

    if uri.scheme_str() != Some("http") {
        return Err(ProxyError::InvalidTarget(format!(
            "target group {group}: {}: scheme must be http",
            target.url
        )));
    }
    if uri.authority().is_none() {
        return Err(ProxyError::InvalidTarget(format!(
            "target group {group}: {}: URL has no authority",
            target.url
        )));
    }
    if target.weight == 0 {
        return Err(ProxyError::Config(format!(
            "target group {group}: {}: weight must be at least 1",
            target.url
        )));
    }

    Ok(ValidatedTarget {
        uri,
        weight: target.weight,
    })
}

fn validate_health_check(group: &str, hc: HealthCheckConfig) -> Result<HealthCheckPolicy> {
    if !hc.path.starts_with('/') {
        return Err(ProxyError::Config(format!(
            "target group {group}: health check path {:?} must start with '/'",
            hc.path
        )));
    }
    if hc.interval == 0 {
        return Err(ProxyError::Config(format!(
            "target group {group}: health check interval must be at least 1"
        )));
    }
    if hc.success_threshold == 0 || hc.failure_threshold == 0 {
        return Err(ProxyError::Config(format!(
            "target group {group}: health check thresholds must be at least 1"
        )));
    }

    Ok(HealthCheckPolicy {
        enabled: hc.enabled,
        path: hc.path,
        interval: Duration::from_millis(hc.interval),
        success_threshold: hc.success_threshold,
        failure_threshold: hc.failure_threshold,
    })
}

/// Fully validated, ready-to-use configuration.
///
/// Created once at startup and shared across all request handlers via `Arc`.
#[derive(Debug)]
pub struct RuntimeConfig {
    /// Algorithm used by groups without a per-group override.
    pub default_algorithm: AlgorithmKind,
    /// Overall timeout for a single upstream exchange.
    pub request_timeout: Duration,
    /// TCP connect timeout, derived from the same configured value.
    pub connect_timeout: Duration,
    pub header_convention_enabled: bool,
    pub retry_enabled: bool,
    /// Backoff before the first retry; doubles on each subsequent attempt.
    pub retry_backoff: Duration,
    /// Maximum retries after the initial attempt.
    pub retry_count: u32,
    pub listener_port: u16,
    /// Validated groups in name order, pre-DNS-expansion.
    pub groups: Vec<ValidatedGroup>,
}

/// A validated target group, ready for DNS expansion into runtime state.
#[derive(Debug)]
pub struct ValidatedGroup {
    pub name: String,
    pub path_prefix: String,
    pub algorithm: AlgorithmKind,
    pub path_rewrite: Option<String>,
    pub health_check: Option<HealthCheckPolicy>,
    pub targets: Vec<ValidatedTarget>,
}

/// A validated target URL and weight.
#[derive(Debug, Clone)]
pub struct ValidatedTarget {
    pub uri: hyper::Uri,
    pub weight: u32,
}

/// Validated health check settings for a target group.
#[derive(Debug, Clone)]
pub struct HealthCheckPolicy {
    pub enabled: bool,
    pub path: String,
    pub interval: Duration,
    pub success_threshold: u32,
    pub failure_threshold: u32,
}
