//! Liveness/readiness/dependency health (§6.1, SPEC_FULL A.6): `/healthz`
//! never touches a dependency, `/readyz` bounds its dependency pings to
//! ≤250ms, `/health` is the unbounded full report used by operators.

use std::time::Duration;

use poem_openapi::payload::Json;
use poem_openapi::{Object, OpenApi};

use crate::api::ApiTags;
use crate::bootstrap::Services;
use crate::model::{HealthcheckResponse, VersionInfo};

const READYZ_BUDGET: Duration = Duration::from_millis(250);

pub struct HealthcheckApi {
    pub services: Services,
}

#[derive(Debug, Clone, Object)]
pub struct DependencyHealth {
    pub kv_ok: bool,
    pub object_store_ok: bool,
    pub backend_ok: bool,
}

impl DependencyHealth {
    fn all_ok(&self) -> bool {
        self.kv_ok && self.object_store_ok && self.backend_ok
    }
}

#[OpenApi(prefix_path = "/", tag = "ApiTags::HealthCheck")]
impl HealthcheckApi {
    /// Liveness: the process is up and answering HTTP. No dependency calls.
    #[oai(path = "/healthz", method = "get", operation_id = "healthz")]
    async fn healthz(&self) -> Json<HealthcheckResponse> {
        Json(HealthcheckResponse { status: "ok".to_string() })
    }

    /// Readiness: bounded (≤250ms) pings of KV and the object store.
    #[oai(path = "/readyz", method = "get", operation_id = "readyz")]
    async fn readyz(&self) -> Json<DependencyHealth> {
        let kv_ok = tokio::time::timeout(READYZ_BUDGET, self.services.kv.exists("__readyz__"))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false);

        let object_store_ok = tokio::time::timeout(READYZ_BUDGET, self.services.object_store.ensure_bucket())
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false);

        Json(DependencyHealth { kv_ok, object_store_ok, backend_ok: true })
    }

    /// Full, unbounded dependency report, including a real backend probe.
    #[oai(path = "/health", method = "get", operation_id = "health")]
    async fn health(&self) -> Json<DependencyHealth> {
        let kv_ok = self.services.kv.exists("__health__").await.is_ok();
        let object_store_ok = self.services.object_store.ensure_bucket().await.is_ok();
        let backend_ok = self.services.backend.health().await;

        let health = DependencyHealth { kv_ok, object_store_ok, backend_ok };
        tracing::debug!(all_ok = health.all_ok(), "dependency health check complete");
        Json(health)
    }

    #[oai(path = "/version", method = "get", operation_id = "version")]
    async fn version(&self) -> Json<VersionInfo> {
        Json(VersionInfo { version: crate::VERSION.to_string() })
    }
}
