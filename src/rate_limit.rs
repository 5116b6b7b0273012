//! C5 — Rate Limiter & Quotas: fixed-window counters and per-role quotas (§4.5).

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::SafeDisplay;
use crate::kv::{KeyValueStore, KvError};
use crate::metrics::Metrics;
use crate::model::RoleQuota;
use crate::repo::{JobRepository, RepoError};

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },
    #[error("quota exceeded: {kind}")]
    QuotaExceeded { kind: QuotaKind },
    #[error("rate limiter store unavailable: {0}")]
    Unavailable(String),
}

impl SafeDisplay for RateLimitError {
    fn to_safe_string(&self) -> String {
        match self {
            RateLimitError::RateLimited { retry_after_seconds } => {
                format!("rate limit exceeded, retry after {retry_after_seconds}s")
            }
            RateLimitError::QuotaExceeded { kind } => format!("quota exceeded: {kind}"),
            RateLimitError::Unavailable(_) => "rate limiting is temporarily unavailable".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    Daily,
    Concurrent,
}

impl std::fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaKind::Daily => write!(f, "daily"),
            QuotaKind::Concurrent => write!(f, "concurrent"),
        }
    }
}

impl From<KvError> for RateLimitError {
    fn from(err: KvError) -> Self {
        RateLimitError::Unavailable(err.to_string())
    }
}

impl From<RepoError> for RateLimitError {
    fn from(err: RepoError) -> Self {
        RateLimitError::Unavailable(err.to_string())
    }
}

/// The `X-RateLimit-*`/`Retry-After` headers of §4.5, ready to attach to a response.
#[derive(Debug, Clone)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset_unix_seconds: u64,
    pub retry_after_seconds: Option<u64>,
}

pub struct RateLimiter {
    kv: Arc<dyn KeyValueStore>,
    key_prefix: String,
    window: Duration,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KeyValueStore>, key_prefix: String, window: Duration, metrics: Arc<Metrics>) -> Self {
        Self { kv, key_prefix, window, metrics }
    }

    fn window_start(&self) -> u64 {
        let now = Utc::now().timestamp() as u64;
        now - (now % self.window.as_secs().max(1))
    }

    /// Fixed-window increment for `(owner_token, endpoint)`, §4.5. `limit == 0`
    /// short-circuits (unlimited role).
    pub async fn check(
        &self,
        owner_token: &str,
        endpoint: &str,
        limit: u32,
    ) -> Result<RateLimitHeaders, RateLimitError> {
        if limit == u32::MAX {
            return Ok(RateLimitHeaders {
                limit,
                remaining: limit,
                reset_unix_seconds: 0,
                retry_after_seconds: None,
            });
        }

        let window_start = self.window_start();
        let key = format!(
            "{}:rl:{}:{}:{}",
            self.key_prefix, owner_token, endpoint, window_start
        );
        let count = self.kv.incr_with_ttl(&key, self.window).await?;
        let reset_at = window_start + self.window.as_secs();

        if count as u64 > u64::from(limit) {
            let ttl = self.kv.get_ttl(&key).await?.unwrap_or(self.window);
            self.metrics.rate_limit_rejections_total.inc();
            return Err(RateLimitError::RateLimited {
                retry_after_seconds: ttl.as_secs().min(self.window.as_secs()),
            });
        }

        Ok(RateLimitHeaders {
            limit,
            remaining: limit.saturating_sub(count as u32),
            reset_unix_seconds: reset_at,
            retry_after_seconds: None,
        })
    }
}

pub struct QuotaChecker {
    kv: Arc<dyn KeyValueStore>,
    repo: Arc<dyn JobRepository>,
    key_prefix: String,
}

impl QuotaChecker {
    pub fn new(kv: Arc<dyn KeyValueStore>, repo: Arc<dyn JobRepository>, key_prefix: String) -> Self {
        Self { kv, repo, key_prefix }
    }

    /// Increments and checks the daily counter (§4.5); rotates implicitly by
    /// UTC-day key suffix, TTL 48h to cover boundary races.
    pub async fn check_daily(&self, owner_token: &str, quota: &RoleQuota) -> Result<(), RateLimitError> {
        if quota.unlimited() {
            return Ok(());
        }
        let day = Utc::now().format("%Y%m%d").to_string();
        let key = format!("{}:quota:{}:{}", self.key_prefix, owner_token, day);
        let count = self.kv.incr_with_ttl(&key, Duration::from_secs(48 * 3600)).await?;
        if count as u64 > u64::from(quota.daily_limit) {
            return Err(RateLimitError::QuotaExceeded { kind: QuotaKind::Daily });
        }
        Ok(())
    }

    /// Checks the principal's count of jobs currently in a non-terminal
    /// state against the role's concurrent limit (§4.5). Derived from the
    /// owner index rather than maintained as a separate counter.
    pub async fn check_concurrent(
        &self,
        owner_token: &str,
        quota: &RoleQuota,
    ) -> Result<(), RateLimitError> {
        if quota.unlimited() {
            return Ok(());
        }
        let job_ids = self.repo.list_for_owner(owner_token).await?;
        let mut in_flight = 0u32;
        for job_id in job_ids {
            if let Some(record) = self.repo.read(&job_id).await? {
                if !record.status.is_terminal() {
                    in_flight += 1;
                }
            }
        }
        if in_flight >= quota.concurrent_limit {
            return Err(RateLimitError::QuotaExceeded {
                kind: QuotaKind::Concurrent,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{JobRepository, KvJobRepository};
    use crate::testing::fakes::InMemoryKv;

    #[test]
    fn window_start_is_aligned_to_window_size() {
        let limiter = RateLimiter {
            kv: Arc::new(crate::testing::fakes::InMemoryKv::new()),
            key_prefix: "P".to_string(),
            window: Duration::from_secs(60),
            metrics: Arc::new(Metrics::new().unwrap()),
        };
        let start = limiter.window_start();
        assert_eq!(start % 60, 0);
    }

    /// Property 6 (§8): pro's 20/min limit, the 21st request within the
    /// window is rejected with a bounded `Retry-After`.
    #[tokio::test]
    async fn the_request_past_the_per_minute_limit_is_rate_limited() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKv::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let limiter = RateLimiter::new(kv, "P".to_string(), Duration::from_secs(60), metrics.clone());

        for _ in 0..20 {
            limiter.check("pro-user", "submit_job", 20).await.unwrap();
        }
        let err = limiter.check("pro-user", "submit_job", 20).await.unwrap_err();
        match err {
            RateLimitError::RateLimited { retry_after_seconds } => {
                assert!(retry_after_seconds <= 60);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        assert_eq!(metrics.rate_limit_rejections_total.get(), 1);
    }

    /// S7 (§8): with role=free, the 6th submission within the window is
    /// rejected with `remaining == 0`. Reads the limit from
    /// `RateLimitConfig::default()` rather than a literal so this regresses
    /// if the free per-minute quota ever drifts out of sync with S7 again.
    #[tokio::test]
    async fn sixth_free_role_request_within_the_window_is_rate_limited() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKv::new());
        let limiter = RateLimiter::new(kv, "P".to_string(), Duration::from_secs(60), Arc::new(Metrics::new().unwrap()));
        let limit = crate::config::RateLimitConfig::default()
            .quota_for(crate::model::Role::Free)
            .per_minute_limit;

        let mut last_remaining = limit;
        for _ in 0..limit {
            last_remaining = limiter.check("free-user", "submit_job", limit).await.unwrap().remaining;
        }
        assert_eq!(last_remaining, 0);

        let err = limiter.check("free-user", "submit_job", limit).await.unwrap_err();
        assert!(matches!(err, RateLimitError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn requests_under_the_limit_report_decreasing_remaining() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKv::new());
        let limiter = RateLimiter::new(kv, "P".to_string(), Duration::from_secs(60), Arc::new(Metrics::new().unwrap()));

        let first = limiter.check("free-user", "submit_job", 6).await.unwrap();
        let second = limiter.check("free-user", "submit_job", 6).await.unwrap();
        assert_eq!(first.remaining, 5);
        assert_eq!(second.remaining, 4);
    }

    #[tokio::test]
    async fn unlimited_role_never_rate_limits() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKv::new());
        let limiter = RateLimiter::new(kv, "P".to_string(), Duration::from_secs(60), Arc::new(Metrics::new().unwrap()));

        for _ in 0..1000 {
            limiter.check("internal-user", "submit_job", u32::MAX).await.unwrap();
        }
    }

    /// Property 7 (§8): free's 10/day quota, the 11th submission of the day fails.
    #[tokio::test]
    async fn the_eleventh_daily_submission_exceeds_a_ten_per_day_quota() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKv::new());
        let repo: Arc<dyn JobRepository> = Arc::new(KvJobRepository::new(kv.clone(), "P".to_string()));
        let quota_checker = QuotaChecker::new(kv, repo, "P".to_string());
        let quota = crate::model::RoleQuota {
            daily_limit: 10,
            concurrent_limit: 1,
            per_minute_limit: 6,
            max_batch_size: 1,
        };

        for _ in 0..10 {
            quota_checker.check_daily("free-user", &quota).await.unwrap();
        }
        let err = quota_checker.check_daily("free-user", &quota).await.unwrap_err();
        assert!(matches!(
            err,
            RateLimitError::QuotaExceeded { kind: QuotaKind::Daily }
        ));
    }

    /// Property 7 (§8): free's 1-concurrent quota, a second in-flight job fails.
    #[tokio::test]
    async fn a_second_concurrent_job_exceeds_a_one_concurrent_quota() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKv::new());
        let repo: Arc<dyn JobRepository> = Arc::new(KvJobRepository::new(kv.clone(), "P".to_string()));
        let quota_checker = QuotaChecker::new(kv, repo.clone(), "P".to_string());
        let quota = crate::model::RoleQuota {
            daily_limit: 10,
            concurrent_limit: 1,
            per_minute_limit: 6,
            max_batch_size: 1,
        };

        let job_id = crate::model::JobId::generate();
        let record = crate::model::JobRecord::new(
            job_id.clone(),
            "free-user".to_string(),
            "idem".to_string(),
            "{}".to_string(),
        );
        repo.create(&record).await.unwrap();
        repo.index_for_owner("free-user", &job_id).await.unwrap();

        quota_checker.check_concurrent("free-user", &quota).await.unwrap_err();
    }

    #[tokio::test]
    async fn concurrent_quota_ignores_terminal_jobs() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKv::new());
        let repo: Arc<dyn JobRepository> = Arc::new(KvJobRepository::new(kv.clone(), "P".to_string()));
        let quota_checker = QuotaChecker::new(kv, repo.clone(), "P".to_string());
        let quota = crate::model::RoleQuota {
            daily_limit: 10,
            concurrent_limit: 1,
            per_minute_limit: 6,
            max_batch_size: 1,
        };

        let job_id = crate::model::JobId::generate();
        let mut record = crate::model::JobRecord::new(
            job_id.clone(),
            "free-user".to_string(),
            "idem".to_string(),
            "{}".to_string(),
        );
        record.status = crate::model::JobStatus::Succeeded;
        repo.create(&record).await.unwrap();
        repo.index_for_owner("free-user", &job_id).await.unwrap();

        quota_checker.check_concurrent("free-user", &quota).await.unwrap();
    }
}
