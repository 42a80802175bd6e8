use anyhow::{Context, Result};
use axum::{routing::get, Router};
use futures::future::ready;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use stream_connect::config::Config;
use stream_connect::metrics_server::{serve, setup_metrics_routes};
use stream_connect::service::StreamConnectService;

pub async fn index() -> &'static str {
    "stream connect service"
}

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")));
    let router = setup_metrics_routes(router, &config.pipeline_name)
        .context("Failed to install metrics recorder")?;

    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Metrics server on {bind} stopped: {e}");
        }
    }))
}

fn init_logging(debug: bool) {
    let base_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true);

    let log_layer = if debug {
        base_layer
            .with_ansi(true)
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    } else {
        base_layer
            .json()
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;

    init_logging(config.debug);

    info!("Starting stream connect service");
    info!("Configuration loaded: {:?}", config);

    let mut term =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let shutdown = async move {
        tokio::select! {
            _ = term.recv() => {},
            _ = interrupt.recv() => {},
        }
    };

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}", config.bind_address());

    let service = StreamConnectService::new(config)
        .context("Failed to create stream connect service")?;

    let result = service.run(shutdown).await;

    server_handle.abort();

    result
}
