//! HTTP header processing: forwarding-header conventions and hop-by-hop
//! removal.
//!
//! The conventions stage mutates the outbound header set before upstream
//! dispatch, implementing the de-facto `X-Forwarded-*` convention plus
//! `X-Real-IP` and a per-request `X-Request-Id`. Hop-by-hop headers are
//! stripped per RFC 7230 Section 6.1 from both forwarded requests and
//! relayed responses.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use hyper::header::{HOST, HeaderMap, HeaderName, HeaderValue};

/// Process-wide sequence for request-id generation.
static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

/// Derives the client IP for forwarding headers.
///
/// Takes the last entry of an incoming `X-Forwarded-For` header, else the
/// `X-Real-IP` value, else the TCP peer address. Taking the last entry
/// (rather than the first) mirrors the upstream-appended chain this proxy
/// itself produces.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(xff) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        if let Some(last) = xff.rsplit(',').next() {
            return last.trim().to_owned();
        }
    }

    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return real_ip.to_owned();
    }

    peer.ip().to_string()
}

/// Applies the forwarding-header conventions to the outbound header set.
///
/// Sets `X-Forwarded-For` (appending to any existing chain),
/// `X-Forwarded-Host` and `Host` (the original `Host`, when present),
/// `X-Forwarded-Port` (the listener port), `X-Forwarded-Proto` (`http`;
/// the listener never terminates TLS), `X-Real-IP`, and a locally unique
/// `X-Request-Id`.
pub fn apply_conventions(headers: &mut HeaderMap, peer: SocketAddr, listener_port: u16) {
    let client_ip = client_ip(headers, peer);
    let original_host = headers.get(HOST).cloned();

    let xff = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|existing| format!("{existing}, {client_ip}"))
        .unwrap_or_else(|| client_ip.clone());

    if let Ok(value) = HeaderValue::from_str(&xff) {
        headers.insert("x-forwarded-for", value);
    }

    if let Some(host) = &original_host {
        headers.insert("x-forwarded-host", host.clone());
        headers.insert(HOST, host.clone());
    }

    headers.insert("x-forwarded-port", HeaderValue::from(listener_port));
    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));

    if let Ok(value) = HeaderValue::from_str(&client_ip) {
        headers.insert("x-real-ip", value);
    }

    if let Ok(value) = HeaderValue::from_str(&next_request_id()) {
        headers.insert("x-request-id", value);
    }
}

/// Generates a locally unique request identifier: epoch milliseconds plus
/// a process-wide sequence number.
fn next_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    format!("{millis:x}-{:x}", REQUEST_SEQ.fetch_add(1, Ordering::Relaxed))
}

/// Removes all hop-by-hop headers from the given header map.
///
/// Strips the standard set defined in RFC 7230 Section 6.1 (`Connection`,
/// `Keep-Alive`, `Proxy-Authenticate`, `Proxy-Authorization`, `TE`,
/// `Trailers`, `Transfer-Encoding`, `Upgrade`), plus any additional
/// header names declared in the `Connection` header value.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_scoped: Vec<HeaderName> = headers
        .get("connection")
        .and_then(|val| val.to_str().ok())
        .map(|val| {
            val.split(',')
                .filter_map(|s| HeaderName::from_bytes(s.trim().as_bytes()).ok())
                .collect()
        })
        .unwrap_or_default();

    for name in &connection_scoped {
        headers.remove(name);
    }

    for name in [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ] {
        headers.remove(name);
    }
}
