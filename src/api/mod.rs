//! HTTP surface (§6.1): submission API (C6), progress stream (C8), and
//! health/metrics endpoints, assembled into one `poem_openapi::OpenApiService`.

pub mod healthcheck;
pub mod jobs;
pub mod stream;

use poem_openapi::{OpenApiService, Tags};

use crate::bootstrap::Services;

#[derive(Tags)]
pub enum ApiTags {
    /// Job submission, status, cancellation, listing.
    Jobs,
    /// Liveness/readiness/dependency health.
    HealthCheck,
}

pub type Apis = (jobs::JobsApi, healthcheck::HealthcheckApi);

pub fn make_open_api_service(services: &Services) -> OpenApiService<Apis, ()> {
    OpenApiService::new(
        (
            jobs::JobsApi {
                services: services.clone(),
            },
            healthcheck::HealthcheckApi {
                services: services.clone(),
            },
        ),
        "comfy-queue",
        env!("CARGO_PKG_VERSION"),
    )
}
