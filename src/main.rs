use std::net::SocketAddr;
use std::sync::Arc;

use switchyard::balancer::AlgorithmRegistry;
use switchyard::client::build_client;
use switchyard::config::Config;
use switchyard::health::spawn_health_checker;
use switchyard::proxy::ProxyState;
use switchyard::router::Router;
use switchyard::server::{serve, shutdown_signal};
use switchyard::target::TargetGroupRegistry;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE_PATH: &str = "./Config.yml";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::load_from_file(CONFIG_FILE_PATH)
        .and_then(|mut c| {
            c.apply_env_overrides()?;
            c.into_runtime()
        })
        .unwrap_or_else(|e| {
            error!(%e, "failed to load configuration");
            std::process::exit(1);
        });

    info!(
        algorithm = config.default_algorithm.name(),
        request_timeout = ?config.request_timeout,
        header_conventions = config.header_convention_enabled,
        retry_enabled = config.retry_enabled,
        retry_count = config.retry_count,
        retry_backoff = ?config.retry_backoff,
        target_groups = config.groups.len(),
        "configuration loaded"
    );

    let config = Arc::new(config);

    let registry = TargetGroupRegistry::from_config(&config)
        .await
        .unwrap_or_else(|e| {
            error!(%e, "failed to build target groups");
            std::process::exit(1);
        });
    let registry = Arc::new(registry);

    let state = Arc::new(ProxyState {
        router: Router::new(&registry),
        algorithms: AlgorithmRegistry::new(),
        client: build_client(&config),
        config: Arc::clone(&config),
    });

    spawn_health_checker(Arc::clone(&registry));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listener_port));
    let listener = TcpListener::bind(addr).await.unwrap_or_else(|e| {
        error!(%e, %addr, "failed to bind");
        std::process::exit(1);
    });

    info!(%addr, "listening");

    serve(listener, state, shutdown_signal()).await;

    info!("shutdown complete");
}
