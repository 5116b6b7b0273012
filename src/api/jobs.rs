//! Submission API (C6): submit/get/cancel/list, §4.6.

use poem_openapi::param::{Path, Query};
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, OpenApi};
use sha2::{Digest, Sha256};
use tracing::Instrument;

use crate::api::ApiTags;
use crate::auth::Principal;
use crate::bootstrap::Services;
use crate::errors::{ApiError, ErrorBody};
use crate::model::{
    CancelResponse, GenerationRequest, JobId, JobListResponse, JobStatus, StatusResponse, SubmitResponse,
};
use crate::repo::StatusUpdate;

pub struct JobsApi {
    pub services: Services,
}

#[derive(ApiResponse)]
enum SubmitOutcome {
    #[oai(status = 202)]
    Accepted(
        Json<SubmitResponse>,
        #[oai(header = "X-RateLimit-Limit")] u32,
        #[oai(header = "X-RateLimit-Remaining")] u32,
        #[oai(header = "X-RateLimit-Reset")] u64,
    ),
}

#[derive(ApiResponse)]
enum CancelOutcome {
    #[oai(status = 202)]
    Accepted(Json<CancelResponse>),
}

async fn resolve_principal(
    services: &Services,
    authorization: Option<String>,
) -> Result<Principal, ApiError> {
    if !services.config.auth_enabled {
        return Ok(Principal::anonymous());
    }
    let token = authorization
        .and_then(|header| header.strip_prefix("Bearer ").map(|s| s.trim().to_string()))
        .ok_or_else(|| ApiError::Unauthorized(Json(ErrorBody::new("UNAUTHORIZED", "missing bearer token"))))?;

    services.authenticator.authenticate(&token).await.map_err(ApiError::from)
}

fn derive_idempotency_key(request: &GenerationRequest, owner_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.canonical_json().as_bytes());
    hasher.update(owner_token.as_bytes());
    hasher.update(crate::model::PROTOCOL_VERSION.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

#[OpenApi(prefix_path = "/api/v1/jobs", tag = "ApiTags::Jobs")]
impl JobsApi {
    /// Submit a generation job; returns immediately with a queued job id.
    #[oai(path = "/", method = "post", operation_id = "submit_job")]
    async fn submit(
        &self,
        request: Json<GenerationRequest>,
        #[oai(name = "Authorization")] authorization: Option<String>,
        #[oai(name = "Idempotency-Key")] idempotency_key: Option<String>,
    ) -> Result<SubmitOutcome, ApiError> {
        let span = tracing::info_span!("submit_job");
        async move {
            let principal = resolve_principal(&self.services, authorization).await?;
            let quota = self.services.config.rate_limit.quota_for(principal.role);

            let rl_headers = if self.services.config.rate_limit.enabled {
                self.services
                    .rate_limiter
                    .check(&principal.owner_token, "submit_job", quota.per_minute_limit)
                    .await?
            } else {
                crate::rate_limit::RateLimitHeaders {
                    limit: quota.per_minute_limit,
                    remaining: quota.per_minute_limit,
                    reset_unix_seconds: 0,
                    retry_after_seconds: None,
                }
            };

            self.services.quota_checker.check_daily(&principal.owner_token, &quota).await?;
            self.services
                .quota_checker
                .check_concurrent(&principal.owner_token, &quota)
                .await?;

            let request = request.0;
            request.validate(quota.max_batch_size).map_err(ApiError::from)?;

            let idem_key = idempotency_key.unwrap_or_else(|| derive_idempotency_key(&request, &principal.owner_token));

            let job_id = JobId::generate();
            if let Some(existing) = self
                .services
                .repo
                .try_bind_idempotency(&principal.owner_token, &idem_key, &job_id)
                .await?
            {
                let existing_record = self.services.repo.read(&existing).await?;
                if let Some(record) = existing_record {
                    return Ok(SubmitOutcome::Accepted(
                        Json(SubmitResponse {
                            job_id: record.job_id.0.clone(),
                            status: record.status.as_str().to_string(),
                            queued_at: record.queued_at,
                            location: format!("/api/v1/jobs/{}", record.job_id.0),
                        }),
                        rl_headers.limit,
                        rl_headers.remaining,
                        rl_headers.reset_unix_seconds,
                    ));
                }
            }

            let params_json = serde_json::to_string(&request).map_err(|err| {
                ApiError::InternalError(Json(ErrorBody::new("INTERNAL_ERROR", err.to_string())))
            })?;
            let record = crate::model::JobRecord::new(
                job_id.clone(),
                principal.owner_token.clone(),
                idem_key,
                params_json,
            );
            self.services.repo.create(&record).await?;
            self.services
                .repo
                .index_for_owner(&principal.owner_token, &job_id)
                .await?;
            self.services
                .repo
                .enqueue(&self.services.config.worker.queue_name, &job_id)
                .await?;
            self.services.metrics.queue_depth.inc();

            self.services.metrics.jobs_submitted_total.inc();

            Ok(SubmitOutcome::Accepted(
                Json(SubmitResponse {
                    job_id: job_id.0.clone(),
                    status: JobStatus::Queued.as_str().to_string(),
                    queued_at: record.queued_at,
                    location: format!("/api/v1/jobs/{}", job_id.0),
                }),
                rl_headers.limit,
                rl_headers.remaining,
                rl_headers.reset_unix_seconds,
            ))
        }
        .instrument(span)
        .await
    }

    /// Retrieve status, progress, and (once terminal) result or error.
    #[oai(path = "/:job_id", method = "get", operation_id = "get_job")]
    async fn get(&self, job_id: Path<String>) -> Result<Json<StatusResponse>, ApiError> {
        let id = JobId(job_id.0);
        let record = self
            .services
            .repo
            .read(&id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("job {} not found", id.0)))?;
        let response = StatusResponse::from_record(&record)
            .ok_or_else(|| ApiError::InternalError(Json(ErrorBody::new("INTERNAL_ERROR", "corrupt job record"))))?;
        Ok(Json(response))
    }

    /// Request cancellation; §4.6 — no-op on terminal jobs, immediate on queued.
    #[oai(path = "/:job_id", method = "delete", operation_id = "cancel_job")]
    async fn cancel(&self, job_id: Path<String>) -> Result<CancelOutcome, ApiError> {
        let id = JobId(job_id.0);
        let record = self
            .services
            .repo
            .read(&id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("job {} not found", id.0)))?;

        if record.status.is_terminal() {
            return Err(ApiError::not_found(format!(
                "job {} cannot be canceled (already {})",
                id.0,
                record.status.as_str()
            )));
        }

        if record.status == JobStatus::Queued {
            self.services
                .repo
                .update_status(
                    &id,
                    StatusUpdate {
                        status: Some(JobStatus::Canceled),
                        finished_at: Some(chrono::Utc::now()),
                        error: Some(crate::model::JobErrorInfo {
                            message: "canceled before execution started".to_string(),
                            error_type: Some("canceled".to_string()),
                            age_seconds: None,
                        }),
                        ..Default::default()
                    },
                )
                .await?;
            self.services
                .repo
                .remove_queued_handle(&self.services.config.worker.queue_name, &id)
                .await?;
        } else {
            self.services.repo.set_cancel_flag(&id).await?;
            self.services
                .repo
                .update_status(
                    &id,
                    StatusUpdate {
                        status: Some(JobStatus::Canceling),
                        ..Default::default()
                    },
                )
                .await?;
        }

        Ok(CancelOutcome::Accepted(Json(CancelResponse {
            job_id: id.0,
            message: "Cancellation requested".to_string(),
        })))
    }

    /// Principal-scoped, paginated job listing (SPEC_FULL A.6).
    #[oai(path = "/", method = "get", operation_id = "list_jobs")]
    async fn list(
        &self,
        #[oai(name = "Authorization")] authorization: Option<String>,
        cursor: Query<Option<String>>,
        limit: Query<Option<u32>>,
    ) -> Result<Json<JobListResponse>, ApiError> {
        let principal = resolve_principal(&self.services, authorization).await?;
        let job_ids = self.services.repo.list_for_owner(&principal.owner_token).await?;

        let page_size = limit.0.unwrap_or(20).min(100) as usize;
        let start = cursor
            .0
            .as_deref()
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);

        let mut jobs = Vec::new();
        for job_id in job_ids.iter().skip(start).take(page_size) {
            if let Some(record) = self.services.repo.read(job_id).await? {
                if let Some(response) = StatusResponse::from_record(&record) {
                    jobs.push(response);
                }
            }
        }

        let next_cursor = if start + page_size < job_ids.len() {
            Some((start + page_size).to_string())
        } else {
            None
        };

        Ok(Json(JobListResponse { jobs, next_cursor }))
    }
}
