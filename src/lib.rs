//! An HTTP reverse proxy and load balancer built on [hyper] and [tokio].
//!
//! This crate provides the core proxy logic: longest-prefix routing of
//! requests to target groups, pluggable load-balancing algorithms
//! (round-robin, weighted random, least-connections, sticky sessions),
//! path rewriting, standard forwarding headers, a pooled upstream client
//! with separate connect and overall timeouts, retry with exponential
//! backoff, periodic health checks with success/failure hysteresis, and
//! structured observability via [tracing].
//!
//! Every inbound request is assigned a monotonic request ID and wrapped
//! in a [`tracing::Span`] carrying the request method, path, and client
//! address as structured fields.
//!
//! [hyper]: https://hyper.rs/
//! [tokio]: https://tokio.rs/
//! [tracing]: https://docs.rs/tracing

pub mod balancer;
pub mod client;
pub mod config;
pub mod error;
pub mod headers;
pub mod health;
pub mod proxy;
pub mod router;
pub mod server;
pub mod target;

pub use balancer::{AlgorithmKind, AlgorithmRegistry};
pub use client::{HttpClient, UpstreamError, UpstreamResponse, build_client};
pub use config::{
    Config, HealthCheckConfig, HealthCheckPolicy, RuntimeConfig, TargetConfig, TargetGroupConfig,
};
pub use error::ProxyError;
pub use proxy::{ProxyState, handle_request};
pub use router::Router;
pub use target::{Target, TargetGroup, TargetGroupRegistry};

/// Boxed error type used by boxed bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The body type flowing through the proxy pipeline.
pub type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, BoxError>;

pub type Result<T> = std::result::Result<T, ProxyError>;
