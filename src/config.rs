//! Process configuration (§6.5): loaded once at startup from a TOML file
//! overlaid with `COMFY_QUEUE__`-prefixed environment variables.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::errors::SafeDisplay;
use crate::model::{Role, RoleQuota};

/// Generic TOML+env loader, one per binary. Mirrors the layering the
/// teacher's service configs use: a file for defaults, environment variables
/// for per-deployment overrides, split on `__` for nested keys.
pub struct ConfigLoader<T> {
    file_path: PathBuf,
    env_prefix: String,
    _marker: std::marker::PhantomData<T>,
}

impl<T: serde::de::DeserializeOwned + Default> ConfigLoader<T> {
    pub fn new(file_path: PathBuf, env_prefix: &str) -> Self {
        Self {
            file_path,
            env_prefix: env_prefix.to_string(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn load(&self) -> figment::Result<T> {
        Figment::new()
            .merge(Toml::file(&self.file_path))
            .merge(Env::prefixed(&self.env_prefix).split("__"))
            .extract()
    }

    pub fn load_or_default(&self) -> T {
        self.load().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    pub url: String,
    pub key_prefix: String,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "comfyq".to_string(),
        }
    }
}

impl SafeDisplay for KvConfig {
    fn to_safe_string(&self) -> String {
        format!("key_prefix: {}\nurl: <redacted>", self.key_prefix)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    #[serde(with = "humantime_serde")]
    pub artifact_ttl: std::time::Duration,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            bucket: "comfy-queue-artifacts".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            artifact_ttl: std::time::Duration::from_secs(3600),
        }
    }
}

impl SafeDisplay for ObjectStoreConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "bucket: {}\nregion: {}\nendpoint_url: {}\nartifact_ttl: {:?}",
            self.bucket,
            self.region,
            self.endpoint_url.as_deref().unwrap_or("<default>"),
            self.artifact_ttl
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub backend_url: String,
    #[serde(with = "humantime_serde")]
    pub backend_timeout: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub job_timeout: std::time::Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8188".to_string(),
            backend_timeout: std::time::Duration::from_secs(10),
            job_timeout: std::time::Duration::from_secs(600),
        }
    }
}

impl SafeDisplay for BackendConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "backend_url: {}\nbackend_timeout: {:?}\njob_timeout: {:?}",
            self.backend_url, self.backend_timeout, self.job_timeout
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub window: std::time::Duration,
    pub role_quotas: HashMap<String, RoleQuotaConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoleQuotaConfig {
    pub daily_limit: u32,
    pub concurrent_limit: u32,
    pub per_minute_limit: u32,
    pub max_batch_size: u32,
}

impl From<RoleQuotaConfig> for RoleQuota {
    fn from(config: RoleQuotaConfig) -> Self {
        RoleQuota {
            daily_limit: config.daily_limit,
            concurrent_limit: config.concurrent_limit,
            per_minute_limit: config.per_minute_limit,
            max_batch_size: config.max_batch_size,
        }
    }
}

impl RateLimitConfig {
    pub fn quota_for(&self, role: Role) -> RoleQuota {
        let key = match role {
            Role::Free => "free",
            Role::Pro => "pro",
            Role::Internal => "internal",
        };
        self.role_quotas
            .get(key)
            .copied()
            .map(RoleQuota::from)
            .unwrap_or(default_role_quota(role))
    }
}

fn default_role_quota(role: Role) -> RoleQuota {
    match role {
        Role::Free => RoleQuota {
            daily_limit: 10,
            concurrent_limit: 1,
            per_minute_limit: 5,
            max_batch_size: 1,
        },
        Role::Pro => RoleQuota {
            daily_limit: 500,
            concurrent_limit: 5,
            per_minute_limit: 20,
            max_batch_size: 4,
        },
        Role::Internal => RoleQuota {
            daily_limit: u32::MAX,
            concurrent_limit: u32::MAX,
            per_minute_limit: u32::MAX,
            max_batch_size: 8,
        },
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut role_quotas = HashMap::new();
        for role in [Role::Free, Role::Pro, Role::Internal] {
            let quota = default_role_quota(role);
            let key = match role {
                Role::Free => "free",
                Role::Pro => "pro",
                Role::Internal => "internal",
            };
            role_quotas.insert(
                key.to_string(),
                RoleQuotaConfig {
                    daily_limit: quota.daily_limit,
                    concurrent_limit: quota.concurrent_limit,
                    per_minute_limit: quota.per_minute_limit,
                    max_batch_size: quota.max_batch_size,
                },
            );
        }
        Self {
            enabled: true,
            window: std::time::Duration::from_secs(60),
            role_quotas,
        }
    }
}

impl SafeDisplay for RateLimitConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "enabled: {}", self.enabled);
        let _ = writeln!(&mut result, "window: {:?}", self.window);
        for (role, quota) in &self.role_quotas {
            let _ = writeln!(
                &mut result,
                "  {role}: daily={} concurrent={} per_minute={} max_batch_size={}",
                quota.daily_limit, quota.concurrent_limit, quota.per_minute_limit, quota.max_batch_size
            );
        }
        result
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub queue_name: String,
    pub worker_concurrency: u32,
    #[serde(with = "humantime_serde")]
    pub dequeue_poll_timeout: std::time::Duration,
    /// Port for the worker process's own `/metrics` scrape endpoint
    /// (SPEC_FULL A.5 — the worker mirrors the API's Prometheus wiring).
    pub metrics_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_name: "generate".to_string(),
            worker_concurrency: 2,
            dequeue_poll_timeout: std::time::Duration::from_secs(5),
            metrics_port: 9090,
        }
    }
}

impl SafeDisplay for WorkerConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "queue_name: {}\nworker_concurrency: {}\ndequeue_poll_timeout: {:?}\nmetrics_port: {}",
            self.queue_name, self.worker_concurrency, self.dequeue_poll_timeout, self.metrics_port
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "comfy-queue".to_string(),
            json: false,
        }
    }
}

impl SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        format!("service_name: {}\njson: {}", self.service_name, self.json)
    }
}

/// A single API key seeded at startup, analogous to the teacher's
/// `AccountConfig` entries in `CloudServiceConfig::accounts`. Lets an operator
/// stand up a deployment with working credentials before any `/api/v1` call
/// has created one, without a separate account-provisioning step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapApiKeyConfig {
    pub user_id: String,
    pub key: String,
    pub role: Role,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub api_keys: Vec<BootstrapApiKeyConfig>,
}

impl SafeDisplay for BootstrapConfig {
    fn to_safe_string(&self) -> String {
        format!("api_keys: <{} redacted>", self.api_keys.len())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub tracing: TracingConfig,
    pub http_port: u16,
    pub kv: KvConfig,
    pub object_store: ObjectStoreConfig,
    pub backend: BackendConfig,
    pub rate_limit: RateLimitConfig,
    pub worker: WorkerConfig,
    pub auth_enabled: bool,
    pub bootstrap: BootstrapConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::default(),
            http_port: 8080,
            kv: KvConfig::default(),
            object_store: ObjectStoreConfig::default(),
            backend: BackendConfig::default(),
            rate_limit: RateLimitConfig::default(),
            worker: WorkerConfig::default(),
            auth_enabled: false,
            bootstrap: BootstrapConfig::default(),
        }
    }
}

impl SafeDisplay for AppConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:\n{}", indent(&self.tracing.to_safe_string()));
        let _ = writeln!(&mut result, "http_port: {}", self.http_port);
        let _ = writeln!(&mut result, "kv:\n{}", indent(&self.kv.to_safe_string()));
        let _ = writeln!(
            &mut result,
            "object_store:\n{}",
            indent(&self.object_store.to_safe_string())
        );
        let _ = writeln!(&mut result, "backend:\n{}", indent(&self.backend.to_safe_string()));
        let _ = writeln!(
            &mut result,
            "rate_limit:\n{}",
            indent(&self.rate_limit.to_safe_string())
        );
        let _ = writeln!(&mut result, "worker:\n{}", indent(&self.worker.to_safe_string()));
        let _ = writeln!(&mut result, "auth_enabled: {}", self.auth_enabled);
        let _ = writeln!(&mut result, "bootstrap:\n{}", indent(&self.bootstrap.to_safe_string()));
        result
    }
}

fn indent(text: &str) -> String {
    text.lines().map(|line| format!("  {line}")).collect::<Vec<_>>().join("\n")
}

impl AppConfig {
    pub fn load(file_path: PathBuf) -> Self {
        ConfigLoader::new(file_path, "COMFY_QUEUE__").load_or_default()
    }
}
