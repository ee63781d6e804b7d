//! Shared test infrastructure for integration tests.
//!
//! Provides throwaway HTTP backend servers, target-group and proxy-state
//! builders, and utility functions used across all integration test
//! modules.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use switchyard::balancer::{AlgorithmKind, AlgorithmRegistry};
use switchyard::client::build_client;
use switchyard::config::{HealthCheckPolicy, RuntimeConfig};
use switchyard::proxy::{ProxyState, handle_request};
use switchyard::router::Router;
use switchyard::target::{Target, TargetGroup, TargetGroupRegistry};
use switchyard::{BoxBody, ProxyError};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A synthetic client address used in all test invocations.
const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

/// The listener port reported to the header-conventions stage.
pub const TEST_LISTENER_PORT: u16 = 8080;

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_peer() -> SocketAddr {
    TEST_CLIENT_ADDR.parse().unwrap()
}

/// Collects a [`BoxBody`] into [`Bytes`], mapping any body error to a
/// descriptive panic so test assertions remain concise.
pub async fn collect_body(body: BoxBody) -> Bytes {
    body.collect()
        .await
        .expect("failed to collect response body")
        .to_bytes()
}

/// Builds a target group over the given URLs with weight 1 each.
pub fn make_group(prefix: &str, algorithm: AlgorithmKind, urls: &[String]) -> TargetGroup {
    let weighted: Vec<(String, u32)> = urls.iter().map(|u| (u.clone(), 1)).collect();
    make_weighted_group(prefix, algorithm, &weighted)
}

/// Builds a target group with explicit per-target weights.
pub fn make_weighted_group(
    prefix: &str,
    algorithm: AlgorithmKind,
    targets: &[(String, u32)],
) -> TargetGroup {
    let targets = targets
        .iter()
        .map(|(url, weight)| Arc::new(Target::new(url.parse().unwrap(), *weight)))
        .collect();
    TargetGroup::new(
        prefix.to_owned(),
        prefix.to_owned(),
        algorithm,
        None,
        None,
        targets,
    )
}

/// Builds a target group with a path rewrite prefix.
pub fn make_rewriting_group(
    prefix: &str,
    rewrite: &str,
    algorithm: AlgorithmKind,
    urls: &[String],
) -> TargetGroup {
    let targets = urls
        .iter()
        .map(|url| Arc::new(Target::new(url.parse().unwrap(), 1)))
        .collect();
    TargetGroup::new(
        prefix.to_owned(),
        prefix.to_owned(),
        algorithm,
        Some(rewrite.to_owned()),
        None,
        targets,
    )
}

/// Builds a target group with an enabled `/healthz` health check.
pub fn make_checked_group(
    prefix: &str,
    urls: &[String],
    interval: Duration,
    success_threshold: u32,
    failure_threshold: u32,
) -> TargetGroup {
    let targets = urls
        .iter()
        .map(|url| Arc::new(Target::new(url.parse().unwrap(), 1)))
        .collect();
    TargetGroup::new(
        prefix.to_owned(),
        prefix.to_owned(),
        AlgorithmKind::RoundRobin,
        None,
        Some(HealthCheckPolicy {
            enabled: true,
            path: "/healthz".to_owned(),
            interval,
            success_threshold,
            failure_threshold,
        }),
        targets,
    )
}

/// Default runtime configuration used by tests: retries off, conventions
/// on, 2 s timeout.
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        default_algorithm: AlgorithmKind::RoundRobin,
        request_timeout: Duration::from_millis(2000),
        connect_timeout: Duration::from_millis(2000),
        header_convention_enabled: true,
        retry_enabled: false,
        retry_backoff: Duration::from_millis(100),
        retry_count: 3,
        listener_port: TEST_LISTENER_PORT,
        groups: vec![],
    }
}

/// Builds the shared proxy state and registry over the given groups.
pub fn make_state(
    groups: Vec<TargetGroup>,
    config: RuntimeConfig,
) -> (Arc<ProxyState>, Arc<TargetGroupRegistry>) {
    let config = Arc::new(config);
    let registry = Arc::new(TargetGroupRegistry::from_groups(groups));
    let state = Arc::new(ProxyState {
        router: Router::new(&registry),
        algorithms: AlgorithmRegistry::new(),
        client: build_client(&config),
        config,
    });
    (state, registry)
}

/// Runs one request through the pipeline, mapping pipeline errors to their
/// canonical responses exactly as the listener does.
pub async fn send_request(
    state: &Arc<ProxyState>,
    req: Request<Full<Bytes>>,
) -> Response<BoxBody> {
    handle_request(req, Arc::clone(state), test_peer(), TEST_LISTENER_PORT)
        .await
        .unwrap_or_else(ProxyError::into_response)
}

/// Convenience GET through the pipeline.
pub async fn get(state: &Arc<ProxyState>, path: &str) -> Response<BoxBody> {
    let req = Request::builder()
        .method(hyper::Method::GET)
        .uri(path)
        .body(Full::new(Bytes::new()))
        .unwrap();
    send_request(state, req).await
}

/// Returns an address nothing is listening on.
pub async fn unreachable_addr() -> SocketAddr {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind throwaway listener");
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Formats a backend address as a target URL.
pub fn url_of(addr: SocketAddr) -> String {
    format!("http://{addr}")
}

/// Starts a local HTTP server that responds to every request with the given
/// status and body. Returns the server address and a shutdown handle.
pub async fn start_backend(
    status: StatusCode,
    body: &'static str,
) -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let service = service_fn(move |_req: Request<Incoming>| async move {
                        Ok::<_, std::convert::Infallible>(
                            Response::builder()
                                .status(status)
                                .header("content-type", "text/plain")
                                .body(Full::new(Bytes::from(body)))
                                .expect("test response must build"),
                        )
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}

/// Starts a backend that counts hits and answers with the given body.
pub async fn start_counting_backend(
    status: StatusCode,
    body: &'static str,
) -> (SocketAddr, Arc<AtomicUsize>, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();
    let hits = Arc::new(AtomicUsize::new(0));

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let counter = Arc::clone(&counter);
                    let service = service_fn(move |_req: Request<Incoming>| {
                        let counter = Arc::clone(&counter);
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, std::convert::Infallible>(
                                Response::builder()
                                    .status(status)
                                    .body(Full::new(Bytes::from(body)))
                                    .expect("test response must build"),
                            )
                        }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, hits, tx)
}

/// Starts a backend that echoes the request line and headers as its
/// response body, one `name: value` pair per line, sorted. The first line
/// is `METHOD uri`.
pub async fn start_echo_backend() -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let mut lines = vec![format!("{} {}", req.method(), req.uri())];
                        let mut headers: Vec<String> = req
                            .headers()
                            .iter()
                            .filter_map(|(name, value)| {
                                value
                                    .to_str()
                                    .ok()
                                    .map(|v| format!("{}: {}", name.as_str(), v))
                            })
                            .collect();
                        headers.sort();
                        lines.extend(headers);

                        Ok::<_, std::convert::Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("content-type", "text/plain")
                                .body(Full::new(Bytes::from(lines.join("\n"))))
                                .expect("test response must build"),
                        )
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}

/// Starts a backend that fails the first `failures` requests with
/// `fail_status`, then answers 200. Records the arrival instant of every
/// hit so tests can measure retry backoff.
pub async fn start_flaky_backend(
    failures: usize,
    fail_status: StatusCode,
) -> (SocketAddr, Arc<Mutex<Vec<Instant>>>, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();
    let hits = Arc::new(Mutex::new(Vec::new()));

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    let recorder = Arc::clone(&hits);
    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let recorder = Arc::clone(&recorder);
                    let service = service_fn(move |_req: Request<Incoming>| {
                        let recorder = Arc::clone(&recorder);
                        async move {
                            let attempt = {
                                let mut hits = recorder.lock().unwrap();
                                hits.push(Instant::now());
                                hits.len()
                            };
                            let (status, body) = if attempt <= failures {
                                (fail_status, "not yet")
                            } else {
                                (StatusCode::OK, "recovered")
                            };
                            Ok::<_, std::convert::Infallible>(
                                Response::builder()
                                    .status(status)
                                    .body(Full::new(Bytes::from(body)))
                                    .expect("test response must build"),
                            )
                        }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, hits, tx)
}

/// Starts a backend that sleeps for the given duration before responding.
pub async fn start_slow_backend(delay: Duration) -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let service = service_fn(move |_req: Request<Incoming>| async move {
                        tokio::time::sleep(delay).await;
                        Ok::<_, std::convert::Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .body(Full::new(Bytes::from("slow")))
                                .expect("test response must build"),
                        )
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}

/// Starts a backend whose `/healthz` endpoint answers with the status code
/// currently held in `health_status`; every other path answers 200 with
/// the given body.
pub async fn start_probed_backend(
    health_status: Arc<AtomicU16>,
    body: &'static str,
) -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let health_status = Arc::clone(&health_status);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let health_status = Arc::clone(&health_status);
                        async move {
                            let status = if req.uri().path() == "/healthz" {
                                StatusCode::from_u16(health_status.load(Ordering::SeqCst))
                                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                            } else {
                                StatusCode::OK
                            };
                            Ok::<_, std::convert::Infallible>(
                                Response::builder()
                                    .status(status)
                                    .body(Full::new(Bytes::from(body)))
                                    .expect("test response must build"),
                            )
                        }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}
