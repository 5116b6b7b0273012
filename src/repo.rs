//! C4 — Job Repository: job records, idempotency mapping, and the
//! in-progress set (§4.4).

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::SafeDisplay;
use crate::kv::{KeyValueStore, KvError};
use crate::model::{JobErrorInfo, JobId, JobRecord, JobResult, JobStatus};

const JOB_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("job repository unavailable: {0}")]
    Unavailable(String),
    #[error("job record is corrupt: {0}")]
    Corrupt(String),
}

impl SafeDisplay for RepoError {
    fn to_safe_string(&self) -> String {
        "the job repository is temporarily unavailable".to_string()
    }
}

impl From<KvError> for RepoError {
    fn from(err: KvError) -> Self {
        RepoError::Unavailable(err.to_string())
    }
}

/// Fields a caller may update on an existing record (§4.4 `update_status`).
/// `None` leaves the corresponding field untouched.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub result: Option<JobResult>,
    pub error: Option<JobErrorInfo>,
    pub started_at: Option<chrono::DateTime<Utc>>,
    pub finished_at: Option<chrono::DateTime<Utc>>,
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create(&self, record: &JobRecord) -> Result<(), RepoError>;
    async fn read(&self, job_id: &JobId) -> Result<Option<JobRecord>, RepoError>;
    async fn update_status(&self, job_id: &JobId, update: StatusUpdate) -> Result<(), RepoError>;

    /// Binds `(owner_token, key) -> job_id` if unbound; returns the
    /// pre-existing job_id if the binding already exists. Never mutates an
    /// existing binding.
    async fn try_bind_idempotency(
        &self,
        owner_token: &str,
        key: &str,
        job_id: &JobId,
    ) -> Result<Option<JobId>, RepoError>;

    async fn mark_in_progress(&self, job_id: &JobId) -> Result<(), RepoError>;
    async fn unmark_in_progress(&self, job_id: &JobId) -> Result<(), RepoError>;
    async fn list_in_progress(&self) -> Result<Vec<JobId>, RepoError>;

    /// Records `job_id` under the owner's listing set for §6.1 `GET /jobs`.
    async fn index_for_owner(&self, owner_token: &str, job_id: &JobId) -> Result<(), RepoError>;
    async fn list_for_owner(&self, owner_token: &str) -> Result<Vec<JobId>, RepoError>;

    /// Best-effort removal of a queued handle (cancel-while-queued, §4.6).
    async fn remove_queued_handle(&self, queue_name: &str, job_id: &JobId) -> Result<(), RepoError>;
    async fn enqueue(&self, queue_name: &str, job_id: &JobId) -> Result<(), RepoError>;
    async fn dequeue(&self, queue_name: &str, timeout: Duration) -> Result<Option<JobId>, RepoError>;

    async fn set_cancel_flag(&self, job_id: &JobId) -> Result<(), RepoError>;
    async fn cancel_requested(&self, job_id: &JobId) -> Result<bool, RepoError>;
}

/// `P:ws:jobs:{job_id}`, the per-job pub/sub channel (§3 "Progress channel").
/// Free function rather than a `JobRepository` method: C7/C8/C9 publish and
/// subscribe directly against the KV store, bypassing the repository.
pub fn progress_channel_key(key_prefix: &str, job_id: &JobId) -> String {
    format!("{key_prefix}:ws:jobs:{job_id}")
}

pub struct KvJobRepository {
    kv: Arc<dyn KeyValueStore>,
    key_prefix: String,
}

impl KvJobRepository {
    pub fn new(kv: Arc<dyn KeyValueStore>, key_prefix: String) -> Self {
        Self { kv, key_prefix }
    }

    fn job_key(&self, job_id: &JobId) -> String {
        format!("{}:jobs:{}", self.key_prefix, job_id)
    }

    fn idemp_key(&self, owner_token: &str, key: &str) -> String {
        format!("{}:idemp:{}:{}", self.key_prefix, owner_token, key)
    }

    fn inprogress_key(&self) -> String {
        format!("{}:jobs:inprogress", self.key_prefix)
    }

    fn owner_index_key(&self, owner_token: &str) -> String {
        format!("{}:jobs:by-owner:{}", self.key_prefix, owner_token)
    }

    fn cancel_flag_key(&self, job_id: &JobId) -> String {
        format!("{}:jobs:{}:cancel", self.key_prefix, job_id)
    }

    fn record_to_fields(record: &JobRecord) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("job_id".to_string(), record.job_id.0.clone());
        fields.insert("status".to_string(), record.status.as_str().to_string());
        fields.insert("progress".to_string(), record.progress.to_string());
        fields.insert("owner_token".to_string(), record.owner_token.clone());
        fields.insert("idempotency_key".to_string(), record.idempotency_key.clone());
        fields.insert("params_json".to_string(), record.params_json.clone());
        if let Some(result) = &record.result_json {
            fields.insert("result_json".to_string(), result.clone());
        }
        if let Some(error) = &record.error_json {
            fields.insert("error_json".to_string(), error.clone());
        }
        fields.insert("queued_at".to_string(), record.queued_at.to_rfc3339());
        if let Some(started_at) = record.started_at {
            fields.insert("started_at".to_string(), started_at.to_rfc3339());
        }
        if let Some(finished_at) = record.finished_at {
            fields.insert("finished_at".to_string(), finished_at.to_rfc3339());
        }
        fields.insert("protocol_version".to_string(), record.protocol_version.clone());
        fields
    }

    fn fields_to_record(fields: HashMap<String, String>) -> Result<JobRecord, RepoError> {
        let get = |name: &str| -> Result<String, RepoError> {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| RepoError::Corrupt(format!("missing field {name}")))
        };

        let status: JobStatus = get("status")?
            .parse()
            .map_err(RepoError::Corrupt)?;
        let progress: f64 = get("progress")?
            .parse()
            .map_err(|_| RepoError::Corrupt("progress is not a float".to_string()))?;
        let queued_at = chrono::DateTime::parse_from_rfc3339(&get("queued_at")?)
            .map_err(|err| RepoError::Corrupt(err.to_string()))?
            .with_timezone(&Utc);
        let started_at = fields
            .get("started_at")
            .map(|s| chrono::DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)))
            .transpose()
            .map_err(|err| RepoError::Corrupt(err.to_string()))?;
        let finished_at = fields
            .get("finished_at")
            .map(|s| chrono::DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)))
            .transpose()
            .map_err(|err| RepoError::Corrupt(err.to_string()))?;

        Ok(JobRecord {
            job_id: JobId(get("job_id")?),
            status,
            progress,
            owner_token: get("owner_token")?,
            idempotency_key: get("idempotency_key")?,
            params_json: get("params_json")?,
            result_json: fields.get("result_json").cloned(),
            error_json: fields.get("error_json").cloned(),
            queued_at,
            started_at,
            finished_at,
            protocol_version: get("protocol_version")?,
        })
    }
}

#[async_trait]
impl JobRepository for KvJobRepository {
    async fn create(&self, record: &JobRecord) -> Result<(), RepoError> {
        let key = self.job_key(&record.job_id);
        let fields = Self::record_to_fields(record);
        self.kv.hash_set(&key, &fields).await?;
        self.touch_ttl(&key).await?;
        Ok(())
    }

    async fn read(&self, job_id: &JobId) -> Result<Option<JobRecord>, RepoError> {
        let key = self.job_key(job_id);
        match self.kv.hash_get_all(&key).await? {
            Some(fields) => Ok(Some(Self::fields_to_record(fields)?)),
            None => Ok(None),
        }
    }

    async fn update_status(&self, job_id: &JobId, update: StatusUpdate) -> Result<(), RepoError> {
        let key = self.job_key(job_id);
        let mut fields = HashMap::new();

        if let Some(status) = update.status {
            fields.insert("status".to_string(), status.as_str().to_string());
        }
        if let Some(progress) = update.progress {
            fields.insert("progress".to_string(), progress.to_string());
        }
        if let Some(result) = update.result {
            let result_json = serde_json::to_string(&result)
                .map_err(|err| RepoError::Corrupt(err.to_string()))?;
            fields.insert("result_json".to_string(), result_json);
        }
        if let Some(error) = update.error {
            let error_json = serde_json::to_string(&error)
                .map_err(|err| RepoError::Corrupt(err.to_string()))?;
            fields.insert("error_json".to_string(), error_json);
        }
        if let Some(started_at) = update.started_at {
            fields.insert("started_at".to_string(), started_at.to_rfc3339());
        }
        if let Some(finished_at) = update.finished_at {
            fields.insert("finished_at".to_string(), finished_at.to_rfc3339());
        }

        if !fields.is_empty() {
            self.kv.hash_set(&key, &fields).await?;
        }
        self.touch_ttl(&key).await?;
        Ok(())
    }

    async fn try_bind_idempotency(
        &self,
        owner_token: &str,
        key: &str,
        job_id: &JobId,
    ) -> Result<Option<JobId>, RepoError> {
        let idemp_key = self.idemp_key(owner_token, key);
        let created = self
            .kv
            .set_if_absent(&idemp_key, &job_id.0, IDEMPOTENCY_TTL)
            .await?;
        if created {
            return Ok(None);
        }
        let existing = self.kv.get(&idemp_key).await?;
        Ok(existing.map(JobId))
    }

    async fn mark_in_progress(&self, job_id: &JobId) -> Result<(), RepoError> {
        self.kv.set_add(&self.inprogress_key(), &job_id.0).await?;
        Ok(())
    }

    async fn unmark_in_progress(&self, job_id: &JobId) -> Result<(), RepoError> {
        self.kv.set_remove(&self.inprogress_key(), &job_id.0).await?;
        Ok(())
    }

    async fn list_in_progress(&self) -> Result<Vec<JobId>, RepoError> {
        let members = self.kv.set_members(&self.inprogress_key()).await?;
        Ok(members.into_iter().map(JobId).collect())
    }

    async fn index_for_owner(&self, owner_token: &str, job_id: &JobId) -> Result<(), RepoError> {
        self.kv.set_add(&self.owner_index_key(owner_token), &job_id.0).await?;
        Ok(())
    }

    async fn list_for_owner(&self, owner_token: &str) -> Result<Vec<JobId>, RepoError> {
        let members = self.kv.set_members(&self.owner_index_key(owner_token)).await?;
        Ok(members.into_iter().map(JobId).collect())
    }

    async fn remove_queued_handle(&self, queue_name: &str, job_id: &JobId) -> Result<(), RepoError> {
        let queue_key = format!("{}:queue:{}", self.key_prefix, queue_name);
        self.kv.queue_remove(&queue_key, &job_id.0).await?;
        Ok(())
    }

    async fn enqueue(&self, queue_name: &str, job_id: &JobId) -> Result<(), RepoError> {
        let queue_key = format!("{}:queue:{}", self.key_prefix, queue_name);
        self.kv.queue_push(&queue_key, &job_id.0).await?;
        Ok(())
    }

    async fn dequeue(&self, queue_name: &str, timeout: Duration) -> Result<Option<JobId>, RepoError> {
        let queue_key = format!("{}:queue:{}", self.key_prefix, queue_name);
        let payload = self.kv.queue_pop_blocking(&queue_key, timeout).await?;
        Ok(payload.map(JobId))
    }

    async fn set_cancel_flag(&self, job_id: &JobId) -> Result<(), RepoError> {
        let key = self.cancel_flag_key(job_id);
        self.kv.set_if_absent(&key, "1", Duration::from_secs(3600)).await?;
        Ok(())
    }

    async fn cancel_requested(&self, job_id: &JobId) -> Result<bool, RepoError> {
        let key = self.cancel_flag_key(job_id);
        Ok(self.kv.exists(&key).await?)
    }
}

impl KvJobRepository {
    /// Refreshes the 24h job-record TTL (§3, §C.5) on every write so a job
    /// that keeps getting updated doesn't expire out from under itself.
    async fn touch_ttl(&self, key: &str) -> Result<(), RepoError> {
        self.kv.expire(key, JOB_RECORD_TTL).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fakes::InMemoryKv;

    fn repo() -> KvJobRepository {
        KvJobRepository::new(Arc::new(InMemoryKv::new()), "P".to_string())
    }

    fn sample_record(job_id: &JobId) -> JobRecord {
        JobRecord::new(
            job_id.clone(),
            "alice".to_string(),
            "idem-key".to_string(),
            "{}".to_string(),
        )
    }

    #[tokio::test]
    async fn create_then_read_round_trips_every_field() {
        let repo = repo();
        let job_id = JobId::generate();
        let record = sample_record(&job_id);
        repo.create(&record).await.unwrap();

        let read_back = repo.read(&job_id).await.unwrap().unwrap();
        assert_eq!(read_back.job_id, job_id);
        assert_eq!(read_back.status, JobStatus::Queued);
        assert_eq!(read_back.owner_token, "alice");
        assert_eq!(read_back.idempotency_key, "idem-key");
        assert_eq!(read_back.queued_at, record.queued_at);
    }

    #[tokio::test]
    async fn read_of_unknown_job_id_is_none() {
        let repo = repo();
        assert!(repo.read(&JobId::generate()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_status_is_last_writer_wins_per_field() {
        let repo = repo();
        let job_id = JobId::generate();
        repo.create(&sample_record(&job_id)).await.unwrap();

        repo.update_status(
            &job_id,
            StatusUpdate {
                status: Some(JobStatus::Running),
                progress: Some(0.1),
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let mid = repo.read(&job_id).await.unwrap().unwrap();
        assert_eq!(mid.status, JobStatus::Running);
        assert_eq!(mid.progress, 0.1);
        // owner_token untouched by the partial update
        assert_eq!(mid.owner_token, "alice");

        repo.update_status(
            &job_id,
            StatusUpdate {
                status: Some(JobStatus::Succeeded),
                progress: Some(1.0),
                finished_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let done = repo.read(&job_id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.progress, 1.0);
        // the running-phase started_at survives the later partial update
        assert!(done.started_at.is_some());
    }

    #[tokio::test]
    async fn idempotency_binding_is_set_if_absent_and_scoped_per_owner() {
        let repo = repo();
        let key = "same-key";
        let first_job = JobId::generate();
        let second_job = JobId::generate();

        // First bind under "alice" wins; a second attempt under the same
        // owner+key returns the first job id rather than rebinding.
        let outcome = repo.try_bind_idempotency("alice", key, &first_job).await.unwrap();
        assert!(outcome.is_none());
        let outcome = repo.try_bind_idempotency("alice", key, &second_job).await.unwrap();
        assert_eq!(outcome, Some(first_job.clone()));

        // The same key under a different owner is an independent binding
        // (spec §3: "collision across principals is allowed").
        let outcome = repo.try_bind_idempotency("bob", key, &second_job).await.unwrap();
        assert!(outcome.is_none());
        let bob_read = repo.try_bind_idempotency("bob", key, &first_job).await.unwrap();
        assert_eq!(bob_read, Some(second_job));
    }

    #[tokio::test]
    async fn in_progress_set_reflects_mark_and_unmark() {
        let repo = repo();
        let job_a = JobId::generate();
        let job_b = JobId::generate();

        repo.mark_in_progress(&job_a).await.unwrap();
        repo.mark_in_progress(&job_b).await.unwrap();
        let mut members = repo.list_in_progress().await.unwrap();
        members.sort();
        let mut expected = vec![job_a.clone(), job_b.clone()];
        expected.sort();
        assert_eq!(members, expected);

        repo.unmark_in_progress(&job_a).await.unwrap();
        let members = repo.list_in_progress().await.unwrap();
        assert_eq!(members, vec![job_b]);
    }

    #[tokio::test]
    async fn cancel_flag_is_observable_once_set() {
        let repo = repo();
        let job_id = JobId::generate();
        assert!(!repo.cancel_requested(&job_id).await.unwrap());

        repo.set_cancel_flag(&job_id).await.unwrap();
        assert!(repo.cancel_requested(&job_id).await.unwrap());
    }

    #[tokio::test]
    async fn owner_index_lists_only_that_owners_jobs() {
        let repo = repo();
        let alice_job = JobId::generate();
        let bob_job = JobId::generate();
        repo.index_for_owner("alice", &alice_job).await.unwrap();
        repo.index_for_owner("bob", &bob_job).await.unwrap();

        assert_eq!(repo.list_for_owner("alice").await.unwrap(), vec![alice_job]);
        assert_eq!(repo.list_for_owner("bob").await.unwrap(), vec![bob_job]);
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_returns_the_same_handle() {
        let repo = repo();
        let job_id = JobId::generate();
        repo.enqueue("generate", &job_id).await.unwrap();

        let popped = repo.dequeue("generate", Duration::from_millis(50)).await.unwrap();
        assert_eq!(popped, Some(job_id));
    }

    #[tokio::test]
    async fn dequeue_on_an_empty_queue_times_out_to_none() {
        let repo = repo();
        let popped = repo.dequeue("generate", Duration::from_millis(20)).await.unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn remove_queued_handle_prevents_it_from_being_dequeued() {
        let repo = repo();
        let job_id = JobId::generate();
        repo.enqueue("generate", &job_id).await.unwrap();
        repo.remove_queued_handle("generate", &job_id).await.unwrap();

        let popped = repo.dequeue("generate", Duration::from_millis(20)).await.unwrap();
        assert!(popped.is_none());
    }
}
