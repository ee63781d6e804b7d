//! The per-request proxy pipeline.
//!
//! Ordering per request: context initialisation (route binding and path
//! rewrite), header conventions, target selection, upstream dispatch with
//! retry, response relay. Every inbound request is assigned a monotonically
//! increasing request ID and wrapped in a [`tracing::Span`] carrying
//! structured fields for observability.
//!
//! Each upstream attempt increments the target's in-flight counter before
//! dispatch and decrements it when the exchange terminates, on every exit
//! path. Retry candidates are 5xx responses, connect failures, and
//! timeouts; 4xx responses pass through untouched. The backoff before
//! attempt `n` (0-indexed) is `retryBackoffMillis * 2^n`, and retries
//! reuse the originally selected target.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Response};
use hyper::header::HeaderMap;
use tracing::{Instrument, debug, info, warn};

use crate::balancer::AlgorithmRegistry;
use crate::client::{self, HttpClient, UpstreamResponse};
use crate::config::RuntimeConfig;
use crate::router::Router;
use crate::target::{Target, TargetGroup};
use crate::{BoxBody, BoxError, ProxyError, Result, headers};

/// Global monotonic counter for assigning unique request IDs.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Shared, read-only state for all request handlers.
pub struct ProxyState {
    pub config: Arc<RuntimeConfig>,
    pub router: Router,
    pub algorithms: AlgorithmRegistry,
    pub client: HttpClient,
}

/// Per-request mutable state carried through the pipeline stages.
#[derive(Debug)]
pub struct RequestContext {
    pub method: Method,
    pub original_path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub rewrite_path: String,
    pub group: Arc<TargetGroup>,
    pub target: Option<Arc<Target>>,
}

impl RequestContext {
    /// Returns the forwarded path with the original query string attached
    /// verbatim.
    fn forward_path_and_query(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.rewrite_path, query),
            None => self.rewrite_path.clone(),
        }
    }
}

/// The request body as presented to upstream attempts.
///
/// With retries enabled the inbound body is buffered once so later
/// attempts can resend it; with retries disabled it streams through
/// unbuffered (there is exactly one attempt to feed).
enum OutboundBody {
    Buffered(Bytes),
    Streaming(Option<BoxBody>),
}

impl OutboundBody {
    fn next_attempt(&mut self) -> Option<BoxBody> {
        match self {
            Self::Buffered(bytes) => Some(
                Full::new(bytes.clone())
                    .map_err(|never| match never {})
                    .boxed(),
            ),
            Self::Streaming(body) => body.take(),
        }
    }
}

/// Processes a single inbound request through the proxy pipeline.
///
/// Returns the relayed upstream response, or a [`ProxyError`] that the
/// listener maps to one of the canonical proxy statuses (404 routing miss,
/// 503 no healthy target, 502 connect failure, 504 timeout).
pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<ProxyState>,
    peer: SocketAddr,
    listener_port: u16,
) -> Result<Response<BoxBody>>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let span = tracing::info_span!(
        "request",
        id = request_id,
        method = %method,
        path = %path,
        client = %peer,
    );

    async move {
        let Some(group) = state.router.route(&path) else {
            debug!("no listener rule matched");
            return Err(ProxyError::NoRouteMatched);
        };

        let (parts, body) = req.into_parts();
        let mut ctx = RequestContext {
            method: parts.method,
            rewrite_path: rewrite_path(&path, group.path_rewrite()),
            original_path: path,
            query: parts.uri.query().map(str::to_owned),
            headers: parts.headers,
            group: Arc::clone(&group),
            target: None,
        };

        if state.config.header_convention_enabled {
            headers::apply_conventions(&mut ctx.headers, peer, listener_port);
        }
        headers::strip_hop_by_hop(&mut ctx.headers);

        let Some(target) = state
            .algorithms
            .select(group.algorithm(), &group, &ctx.headers)
        else {
            warn!(group = group.name(), "no healthy target available");
            return Err(ProxyError::NoHealthyTarget);
        };
        debug!(
            target = %target.url(),
            algorithm = group.algorithm().name(),
            "selected target"
        );
        ctx.target = Some(Arc::clone(&target));

        let boxed = body.map_err(Into::into).boxed();
        let mut outbound = if state.config.retry_enabled {
            let buffered = boxed
                .collect()
                .await
                .map_err(|e| ProxyError::Internal(format!("failed to read request body: {e}")))?
                .to_bytes();
            OutboundBody::Buffered(buffered)
        } else {
            OutboundBody::Streaming(Some(boxed))
        };

        let start = Instant::now();
        let upstream = execute_with_retry(&state, &ctx, &target, &mut outbound).await?;
        info!(
            status = upstream.status.as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            "upstream responded"
        );

        Ok(relay_response(upstream))
    }
    .instrument(span)
    .await
}

/// Dispatches upstream attempts until one is not a retry candidate or the
/// retry budget is exhausted.
///
/// A single logical request makes at most `retryCount + 1` attempts. When
/// the final attempt produced a real upstream response it is relayed
/// verbatim (including 5xx); otherwise the final transport error maps to
/// 502 or 504.
async fn execute_with_retry(
    state: &ProxyState,
    ctx: &RequestContext,
    target: &Arc<Target>,
    outbound: &mut OutboundBody,
) -> Result<UpstreamResponse> {
    let config = &state.config;
    let max_attempts = if config.retry_enabled {
        config.retry_count.saturating_add(1)
    } else {
        1
    };
    let path_and_query = ctx.forward_path_and_query();
    let mut attempt: u32 = 0;

    loop {
        let body = outbound
            .next_attempt()
            .ok_or_else(|| ProxyError::Internal("request body already consumed".into()))?;

        // The guard restores the counter on every exit path, including a
        // client disconnect cancelling this future mid-exchange.
        let in_flight = InFlightGuard::acquire(target);
        let outcome = client::send(
            &state.client,
            target,
            ctx.method.clone(),
            &path_and_query,
            &ctx.headers,
            body,
            config.request_timeout,
        )
        .await;
        drop(in_flight);

        let retry_candidate = match &outcome {
            Ok(response) => response.status.is_server_error(),
            Err(_) => true,
        };

        if !retry_candidate || attempt + 1 >= max_attempts {
            return match outcome {
                Ok(response) => {
                    if response.status.is_server_error() {
                        warn!(
                            target = %target.url(),
                            status = response.status.as_u16(),
                            attempts = attempt + 1,
                            "relaying upstream server error"
                        );
                    }
                    Ok(response)
                }
                Err(e) => {
                    warn!(
                        target = %target.url(),
                        error = %e,
                        attempts = attempt + 1,
                        "upstream exchange failed"
                    );
                    Err(e.into_proxy_error())
                }
            };
        }

        let backoff = config.retry_backoff * 2u32.saturating_pow(attempt);
        match &outcome {
            Ok(response) => warn!(
                target = %target.url(),
                status = response.status.as_u16(),
                attempt = attempt + 1,
                backoff_ms = backoff.as_millis() as u64,
                "upstream attempt failed, retrying"
            ),
            Err(e) => warn!(
                target = %target.url(),
                error = %e,
                attempt = attempt + 1,
                backoff_ms = backoff.as_millis() as u64,
                "upstream attempt failed, retrying"
            ),
        }

        tokio::time::sleep(backoff).await;
        attempt += 1;
    }
}

/// Holds one in-flight attempt on a target for the duration of an
/// upstream exchange.
struct InFlightGuard<'a> {
    target: &'a Target,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(target: &'a Target) -> Self {
        target.inc_connections();
        Self { target }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.target.dec_connections();
    }
}

/// Copies the upstream status, headers, and buffered body onto the client
/// response, stripping hop-by-hop headers.
fn relay_response(upstream: UpstreamResponse) -> Response<BoxBody> {
    let mut response = Response::new(
        Full::new(upstream.body)
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = upstream.status;
    *response.headers_mut() = upstream.headers;
    headers::strip_hop_by_hop(response.headers_mut());
    response
}

/// Calculates the forwarded path by stripping the configured rewrite
/// prefix.
///
/// An absent or empty prefix leaves the path unchanged, as does a path
/// that does not begin with the prefix. A stripped remainder gets a
/// leading `/` prepended if missing, and an empty remainder collapses to
/// exactly `/`.
pub fn rewrite_path(original: &str, rewrite: Option<&str>) -> String {
    let Some(prefix) = rewrite.filter(|r| !r.is_empty()) else {
        return original.to_owned();
    };

    match original.strip_prefix(prefix) {
        None => original.to_owned(),
        Some("") => "/".to_owned(),
        Some(rest) if rest.starts_with('/') => rest.to_owned(),
        Some(rest) => format!("/{rest}"),
    }
}
