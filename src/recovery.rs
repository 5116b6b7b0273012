//! C9 — Recovery Loop: reconciles in-progress jobs orphaned by a dead
//! worker, run once before a worker starts pulling from the queue (§4.9).

use chrono::Utc;
use std::time::Duration;
use tracing::{info, warn};

use crate::bootstrap::Services;
use crate::model::{JobErrorInfo, JobStatus, ProgressEvent};
use crate::repo::{progress_channel_key, StatusUpdate};

/// Reaps stale in-progress jobs and returns how many were finalized as
/// `failed`. Safe to call repeatedly; jobs still legitimately running on
/// another worker are left untouched.
pub async fn run_once(services: &Services) -> usize {
    let job_ids = match services.repo.list_in_progress().await {
        Ok(ids) => ids,
        Err(err) => {
            warn!(error = %err, "recovery loop could not list in-progress jobs");
            return 0;
        }
    };

    let grace = services.config.backend.job_timeout + Duration::from_secs(60);
    let mut reaped = 0usize;

    for job_id in job_ids {
        let record = match services.repo.read(&job_id).await {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, job_id = %job_id.0, "could not read job record during recovery");
                continue;
            }
        };

        let Some(record) = record else {
            // Orphaned: the record expired but the set entry survived.
            let _ = services.repo.unmark_in_progress(&job_id).await;
            continue;
        };

        if !matches!(record.status, JobStatus::Running | JobStatus::Canceling) {
            // Stale: already terminalized by its owning worker.
            let _ = services.repo.unmark_in_progress(&job_id).await;
            continue;
        }

        let started_at = record.started_at.unwrap_or(record.queued_at);
        let age_seconds = Utc::now().signed_duration_since(started_at).num_seconds().max(0);

        if age_seconds as u64 <= grace.as_secs() {
            // Still within its deadline + grace window; another worker may
            // legitimately still own it.
            continue;
        }

        let error = JobErrorInfo {
            message: "worker crashed or timed out".to_string(),
            error_type: Some("timeout".to_string()),
            age_seconds: Some(age_seconds),
        };

        let finalized = services
            .repo
            .update_status(
                &job_id,
                StatusUpdate {
                    status: Some(JobStatus::Failed),
                    error: Some(error.clone()),
                    finished_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await;

        if let Err(err) = finalized {
            warn!(error = %err, job_id = %job_id.0, "could not finalize stale job during recovery");
            continue;
        }

        let _ = services.repo.unmark_in_progress(&job_id).await;

        let channel = progress_channel_key(&services.config.kv.key_prefix, &job_id);
        let event = ProgressEvent::Done {
            status: JobStatus::Failed.as_str().to_string(),
            result: None,
            error: Some(error),
        };
        if let Ok(json) = serde_json::to_string(&event) {
            let _ = services.kv.publish(&channel, &json).await;
        }

        services.metrics.recovery_reaped_total.inc();
        reaped += 1;
    }

    info!(reaped, "recovery pass complete");
    reaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ApiKeyAuthenticator;
    use crate::backend::BackendClient;
    use crate::config::AppConfig;
    use crate::kv::KeyValueStore;
    use crate::metrics::Metrics;
    use crate::model::JobId;
    use crate::model::JobRecord;
    use crate::rate_limit::{QuotaChecker, RateLimiter};
    use crate::repo::{JobRepository, KvJobRepository};
    use crate::storage::ObjectStore;
    use crate::testing::fakes::{FakeBackendClient, InMemoryKv, InMemoryObjectStore};
    use std::sync::Arc;

    fn test_services() -> Services {
        let mut config = AppConfig::default();
        config.backend.job_timeout = Duration::from_secs(1);
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKv::new());
        let object_store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let repo: Arc<dyn JobRepository> = Arc::new(KvJobRepository::new(kv.clone(), config.kv.key_prefix.clone()));
        let metrics = Arc::new(Metrics::new().unwrap());
        let rate_limiter = Arc::new(RateLimiter::new(
            kv.clone(),
            config.kv.key_prefix.clone(),
            config.rate_limit.window,
            metrics.clone(),
        ));
        let quota_checker = Arc::new(QuotaChecker::new(kv.clone(), repo.clone(), config.kv.key_prefix.clone()));
        let authenticator = Arc::new(ApiKeyAuthenticator::new(kv.clone(), config.kv.key_prefix.clone()));
        Services {
            config: Arc::new(config),
            kv,
            object_store,
            backend: Arc::new(FakeBackendClient::new(1)) as Arc<dyn BackendClient>,
            repo,
            rate_limiter,
            quota_checker,
            authenticator,
            metrics,
        }
    }

    #[tokio::test]
    async fn reaps_jobs_whose_started_at_is_well_past_the_deadline_and_grace() {
        let services = test_services();
        let job_id = JobId::generate();
        let mut record = JobRecord::new(job_id.clone(), "anonymous".to_string(), "idem".to_string(), "{}".to_string());
        record.status = JobStatus::Running;
        record.started_at = Some(Utc::now() - chrono::Duration::seconds(120));
        services.repo.create(&record).await.unwrap();
        services.repo.mark_in_progress(&job_id).await.unwrap();

        let reaped = run_once(&services).await;

        assert_eq!(reaped, 1);
        let updated = services.repo.read(&job_id).await.unwrap().unwrap();
        assert_eq!(updated.status, JobStatus::Failed);
        assert!(updated.error().unwrap().message.contains("worker crashed or timed out"));
        assert!(services.repo.list_in_progress().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn leaves_recently_started_jobs_alone() {
        let services = test_services();
        let job_id = JobId::generate();
        let mut record = JobRecord::new(job_id.clone(), "anonymous".to_string(), "idem".to_string(), "{}".to_string());
        record.status = JobStatus::Running;
        record.started_at = Some(Utc::now());
        services.repo.create(&record).await.unwrap();
        services.repo.mark_in_progress(&job_id).await.unwrap();

        let reaped = run_once(&services).await;

        assert_eq!(reaped, 0);
        let updated = services.repo.read(&job_id).await.unwrap().unwrap();
        assert_eq!(updated.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn removes_orphaned_set_entries_with_no_backing_record() {
        let services = test_services();
        let job_id = JobId::generate();
        services.repo.mark_in_progress(&job_id).await.unwrap();

        let reaped = run_once(&services).await;

        assert_eq!(reaped, 0);
        assert!(services.repo.list_in_progress().await.unwrap().is_empty());
    }
}
