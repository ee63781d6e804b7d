//! Pooled upstream HTTP/1.1 client with timeout and error classification.
//!
//! Connections are pooled per origin by the hyper-util legacy client; idle
//! connections time out and each origin keeps a bounded number of idle
//! sockets. The connect timeout applies only to TCP establishment, while
//! the overall timeout bounds the whole exchange from request initiation
//! to the fully buffered response body.
//!
//! Status codes are never errors at this layer; 4xx and 5xx responses are
//! returned as successes. Failures classify as connect errors, timeouts,
//! or other transport errors, which the pipeline maps to 502/504.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::HeaderMap;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::target::Target;
use crate::{BoxBody, ProxyError};

/// The HTTP client type used for upstream connections.
pub type HttpClient = Client<HttpConnector, BoxBody>;

/// How long pooled connections may sit idle before being closed.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum idle connections kept per upstream origin.
const POOL_MAX_IDLE_PER_HOST: usize = 32;

/// A fully buffered upstream response.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Classified upstream failure. The pipeline decides whether to retry and
/// how to surface the final error.
#[derive(Debug)]
pub enum UpstreamError {
    /// TCP connect or handshake failed (refused, reset, unreachable).
    Connect(String),
    /// The overall timeout elapsed before the response body completed.
    Timeout(Duration),
    /// Any other transport failure mid-exchange.
    Other(String),
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(msg) => write!(f, "connect failed: {msg}"),
            Self::Timeout(t) => write!(f, "timed out after {t:?}"),
            Self::Other(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

impl UpstreamError {
    /// Maps this failure to the canonical proxy error for a final attempt.
    pub fn into_proxy_error(self) -> ProxyError {
        match self {
            Self::Timeout(t) => ProxyError::UpstreamTimeout(t),
            Self::Connect(msg) | Self::Other(msg) => ProxyError::UpstreamConnect(msg),
        }
    }
}

/// Builds the pooled upstream client with the configured connect timeout.
pub fn build_client(config: &RuntimeConfig) -> HttpClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(config.connect_timeout));
    connector.set_nodelay(true);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build(connector)
}

/// Sends one request to the target and buffers the response.
///
/// `path_and_query` is the already-rewritten forwarded path with the
/// original query string attached. The request body is streamed through
/// without buffering; the response body is collected in full before
/// returning, all within `overall_timeout`.
pub async fn send(
    client: &HttpClient,
    target: &Target,
    method: Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: BoxBody,
    overall_timeout: Duration,
) -> Result<UpstreamResponse, UpstreamError> {
    let uri = build_upstream_uri(target, path_and_query)?;
    debug!(target = %target.url(), %uri, "dispatching upstream request");

    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .body(body)
        .map_err(|e| UpstreamError::Other(format!("failed to build request: {e}")))?;
    *request.headers_mut() = headers.clone();

    let exchange = async {
        let response = client.request(request).await.map_err(|e| {
            if e.is_connect() {
                UpstreamError::Connect(e.to_string())
            } else {
                UpstreamError::Other(e.to_string())
            }
        })?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| UpstreamError::Other(format!("failed to read response body: {e}")))?
            .to_bytes();

        Ok(UpstreamResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    };

    match timeout(overall_timeout, exchange).await {
        Ok(result) => result,
        Err(_elapsed) => Err(UpstreamError::Timeout(overall_timeout)),
    }
}

/// Builds the absolute upstream URI from the target's origin and the
/// forwarded path.
fn build_upstream_uri(target: &Target, path_and_query: &str) -> Result<hyper::Uri, UpstreamError> {
    let authority = target
        .url()
        .authority()
        .ok_or_else(|| UpstreamError::Connect("target URL has no authority".into()))?;

    hyper::Uri::builder()
        .scheme("http")
        .authority(authority.clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| UpstreamError::Connect(format!("failed to build upstream URI: {e}")))
}
