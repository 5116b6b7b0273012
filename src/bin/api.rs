//! `comfy-queue-api` — the HTTP submission/status/stream process (C6, C8).

use std::path::PathBuf;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use comfy_queue::config::AppConfig;
use comfy_queue::tracing_init;
use comfy_queue::ComfyQueueApi;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("COMFY_QUEUE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/comfy-queue.toml"));
    let config = AppConfig::load(config_path);

    tracing_init::init(&config.tracing);

    let api = ComfyQueueApi::new(config).await?;

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, draining in-flight connections");
        shutdown_signal.cancel();
    });

    let mut join_set = JoinSet::new();
    let port = api.start_http_server(&mut join_set, shutdown).await?;
    info!(port, "comfy-queue-api ready");

    // `run_with_graceful_shutdown` only returns once the server has drained,
    // so simply waiting out the join set is enough to block until then.
    if let Some(Ok(Err(err))) = join_set.join_next().await {
        return Err(err);
    }

    Ok(())
}
