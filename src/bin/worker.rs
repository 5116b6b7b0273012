//! `comfy-queue-worker` — runs recovery once at startup (C9), then the
//! dequeue/poll/finalize slots (C7), exposing its own `/metrics` endpoint.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;

use poem::listener::TcpListener;
use poem::{EndpointExt, Route};
use tokio_util::sync::CancellationToken;
use tracing::info;

use comfy_queue::bootstrap::Services;
use comfy_queue::config::AppConfig;
use comfy_queue::{metrics, recovery, tracing_init, worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("COMFY_QUEUE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/comfy-queue.toml"));
    let config = AppConfig::load(config_path);

    tracing_init::init(&config.tracing);

    let metrics_port = config.worker.metrics_port;
    let services = Services::new(config).await?;

    let metrics_app = Route::new().at("/metrics", metrics::scrape.data(services.metrics.clone()));
    tokio::spawn(async move {
        let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, metrics_port));
        if let Err(err) = poem::Server::new(listener).run(metrics_app).await {
            tracing::warn!(error = %err, "worker metrics server exited");
        }
    });

    let reaped = recovery::run_once(&services).await;
    info!(reaped, "startup recovery pass complete");

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        shutdown_signal.cancel();
    });

    worker::run(services, shutdown).await;
    Ok(())
}
