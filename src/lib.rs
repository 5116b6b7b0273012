//! `comfy-queue` — a multi-tenant asynchronous job queue and execution plane
//! fronting a remote ComfyUI-compatible image-generation backend.
//!
//! Modeled on Golem Cloud's `cloud-service`: a `poem`/`poem-openapi` HTTP
//! surface over trait-object services wired up in [`bootstrap`], backed by a
//! Redis-compatible store ([`kv`]) and an S3-compatible object store
//! ([`storage`]).

pub mod api;
pub mod auth;
pub mod backend;
pub mod bootstrap;
pub mod config;
pub mod errors;
pub mod kv;
pub mod metrics;
pub mod model;
pub mod rate_limit;
pub mod recovery;
pub mod repo;
pub mod storage;
pub mod tracing_init;
pub mod worker;

#[cfg(test)]
pub mod testing;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use std::net::{Ipv4Addr, SocketAddrV4};

use poem::listener::{Acceptor, Listener, TcpListener};
use poem::middleware::Cors;
use poem::{EndpointExt, Route};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bootstrap::Services;
use crate::config::AppConfig;

/// Top-level handle to a running (or about-to-run) API process, mirroring
/// the `CloudService` struct the teacher builds its `cloud-service` binary
/// around: construct once from config, then start the HTTP server.
#[derive(Clone)]
pub struct ComfyQueueApi {
    services: Services,
}

impl ComfyQueueApi {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let services = Services::new(config).await?;
        Ok(Self { services })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Binds the HTTP listener and spawns the server task onto `join_set`.
    /// Returns the bound port (useful in tests that bind to port 0).
    ///
    /// `shutdown` is awaited for graceful drain (SPEC_FULL A.6): once
    /// canceled, the server stops accepting new connections and waits for
    /// in-flight requests and `/stream` WebSocket connections to finish
    /// before the spawned task completes.
    pub async fn start_http_server(
        &self,
        join_set: &mut JoinSet<anyhow::Result<()>>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<u16> {
        let api_service = api::make_open_api_service(&self.services);
        let ui = api_service.swagger_ui();
        let spec = api_service.spec_endpoint_yaml();

        let metrics_endpoint = crate::metrics::scrape.data(self.services.metrics.clone());

        let app = Route::new()
            .nest("/", api_service)
            .nest("/docs", ui)
            .nest("/specs", spec)
            .nest("/metrics", metrics_endpoint)
            .nest("/stream", api::stream::route(self.services.clone()))
            .with(Cors::new());

        let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.services.config.http_port));
        let acceptor = listener.into_acceptor().await?;
        let port = acceptor.local_addr()[0]
            .as_socket_addr()
            .expect("bound TCP listener has a socket address")
            .port();

        join_set.spawn(async move {
            poem::Server::new_with_acceptor(acceptor)
                .run_with_graceful_shutdown(app, shutdown.cancelled_owned(), None)
                .await
                .map_err(Into::into)
        });

        info!(port, "comfy-queue API listening");
        Ok(port)
    }
}
