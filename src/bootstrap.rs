//! Dependency wiring: turns an [`AppConfig`] into a [`Services`] bundle of
//! trait-object handles, the way `cloud-service`'s `Services::new` wires its
//! repos and services from a `CloudServiceConfig`.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::info;

use crate::auth::ApiKeyAuthenticator;
use crate::backend::{BackendClient, HttpBackendClient};
use crate::config::AppConfig;
use crate::kv::{FredKeyValueStore, KeyValueStore};
use crate::metrics::Metrics;
use crate::rate_limit::{QuotaChecker, RateLimiter};
use crate::repo::{JobRepository, KvJobRepository};
use crate::storage::{ObjectStore, S3ObjectStore};

#[derive(Clone)]
pub struct Services {
    pub config: Arc<AppConfig>,
    pub kv: Arc<dyn KeyValueStore>,
    pub object_store: Arc<dyn ObjectStore>,
    pub backend: Arc<dyn BackendClient>,
    pub repo: Arc<dyn JobRepository>,
    pub rate_limiter: Arc<RateLimiter>,
    pub quota_checker: Arc<QuotaChecker>,
    pub authenticator: Arc<ApiKeyAuthenticator>,
    pub metrics: Arc<Metrics>,
}

impl Services {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let kv: Arc<dyn KeyValueStore> = Arc::new(FredKeyValueStore::connect(&config.kv.url).await?);

        let object_store: Arc<dyn ObjectStore> = Arc::new(
            S3ObjectStore::new(
                config.object_store.bucket.clone(),
                config.object_store.endpoint_url.clone(),
                config.object_store.region.clone(),
            )
            .await,
        );
        object_store.ensure_bucket().await.map_err(|err| anyhow::anyhow!(err.to_string()))?;

        let backend: Arc<dyn BackendClient> = Arc::new(HttpBackendClient::new(
            config.backend.backend_url.clone(),
            std::time::Duration::from_secs(30),
            config.backend.backend_timeout,
        )?);

        let repo: Arc<dyn JobRepository> =
            Arc::new(KvJobRepository::new(kv.clone(), config.kv.key_prefix.clone()));

        let metrics = Arc::new(Metrics::new()?);

        let rate_limiter = Arc::new(RateLimiter::new(
            kv.clone(),
            config.kv.key_prefix.clone(),
            config.rate_limit.window,
            metrics.clone(),
        ));
        let quota_checker = Arc::new(QuotaChecker::new(kv.clone(), repo.clone(), config.kv.key_prefix.clone()));

        let authenticator = Arc::new(ApiKeyAuthenticator::new(kv.clone(), config.kv.key_prefix.clone()));

        bootstrap_api_keys(&kv, &config).await?;

        Ok(Self {
            config: Arc::new(config),
            kv,
            object_store,
            backend,
            repo,
            rate_limiter,
            quota_checker,
            authenticator,
            metrics,
        })
    }
}

/// Seeds the configured API keys (SPEC_FULL A.6), mirroring the teacher's
/// `create_all_initial_accounts`: idempotent, so restarting a deployment with
/// the same `bootstrap.api_keys` entries never disturbs an already-issued key.
async fn bootstrap_api_keys(kv: &Arc<dyn KeyValueStore>, config: &AppConfig) -> anyhow::Result<()> {
    for entry in &config.bootstrap.api_keys {
        let mut hasher = Sha256::new();
        hasher.update(entry.key.as_bytes());
        let digest = hex::encode(hasher.finalize());
        let record_key = format!("{}:apikey:{}", config.kv.key_prefix, digest);

        if kv.exists(&record_key).await.unwrap_or(false) {
            continue;
        }

        info!(user_id = %entry.user_id, role = ?entry.role, "seeding bootstrap API key");
        let mut fields = HashMap::new();
        fields.insert("user_id".to_string(), entry.user_id.clone());
        fields.insert("role".to_string(), format!("{:?}", entry.role).to_lowercase());
        fields.insert("is_active".to_string(), "true".to_string());
        kv.hash_set(&record_key, &fields).await?;
    }
    Ok(())
}
