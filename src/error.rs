//! Error types and HTTP status code mapping.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{Response, StatusCode};

use crate::BoxBody;

/// Every failure the proxy can produce, each mapping to a specific HTTP status.
///
/// Canonical proxy responses (routing miss, no healthy target, upstream
/// connect failure, upstream timeout) carry empty bodies so that clients can
/// distinguish proxy-generated statuses from upstream payloads.
#[derive(Debug)]
pub enum ProxyError {
    /// The configuration file could not be loaded or failed validation.
    Config(String),
    /// A configured target URL is malformed or unusable.
    InvalidTarget(String),
    /// No listener rule matched the request path.
    NoRouteMatched,
    /// A rule matched but its group has no healthy target.
    NoHealthyTarget,
    /// The upstream connection failed on the final attempt.
    UpstreamConnect(String),
    /// The upstream exchange exceeded the overall timeout on the final attempt.
    UpstreamTimeout(Duration),
    /// An internal error that does not fit other categories.
    Internal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::InvalidTarget(msg) => write!(f, "invalid target: {msg}"),
            Self::NoRouteMatched => write!(f, "no listener rule matched"),
            Self::NoHealthyTarget => write!(f, "no healthy target available"),
            Self::UpstreamConnect(msg) => write!(f, "upstream connection failed: {msg}"),
            Self::UpstreamTimeout(t) => write!(f, "upstream timed out after {t:?}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl ProxyError {
    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::InvalidTarget(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NoRouteMatched => StatusCode::NOT_FOUND,
            Self::NoHealthyTarget => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamConnect(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Converts this error into the canonical empty-body HTTP response.
    pub fn into_response(self) -> Response<BoxBody> {
        Response::builder()
            .status(self.status_code())
            .body(empty_body())
            .unwrap_or_else(|_| {
                let mut resp = Response::new(empty_body());
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            })
    }
}

/// An empty response body of the crate-wide boxed body type.
pub fn empty_body() -> BoxBody {
    http_body_util::Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}
