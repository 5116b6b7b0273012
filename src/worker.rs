//! C7 — Worker: dequeues job handles, drives the backend to completion,
//! transfers artifacts, and finalizes job status (§4.7).
//!
//! Each slot is a single-threaded, I/O-bound loop; `N` slots run
//! concurrently as independent tasks per §5 "Scheduling model".

use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use crate::backend::{BackendError, ImageRef, PollToCompletionOutcome};
use crate::bootstrap::Services;
use crate::errors::SafeDisplay;
use crate::model::{Artifact, JobErrorInfo, JobId, JobRecord, JobResult, JobStatus, ProgressEvent};
use crate::repo::{progress_channel_key, StatusUpdate};

/// Runs `worker_concurrency` independent slots against the configured queue
/// until `shutdown` is triggered. Returns once every slot has wound down.
pub async fn run(services: Services, shutdown: CancellationToken) {
    let mut slots = JoinSet::new();
    for slot_id in 0..services.config.worker.worker_concurrency {
        let services = services.clone();
        let shutdown = shutdown.clone();
        slots.spawn(
            async move { run_slot(slot_id, services, shutdown).await }
                .instrument(tracing::info_span!("worker_slot", slot_id)),
        );
    }
    while slots.join_next().await.is_some() {}
}

async fn run_slot(slot_id: u32, services: Services, shutdown: CancellationToken) {
    info!("worker slot started");
    while !shutdown.is_cancelled() {
        let popped = services
            .repo
            .dequeue(&services.config.worker.queue_name, services.config.worker.dequeue_poll_timeout)
            .await;

        match popped {
            Ok(Some(job_id)) => {
                services.metrics.queue_depth.dec();
                let span = tracing::info_span!("execute_job", job_id = %job_id.0);
                execute_job(&services, &job_id).instrument(span).await;
            }
            Ok(None) => continue,
            Err(err) => {
                warn!(error = %err, "dequeue failed; backing off");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    info!("worker slot stopped");
}

/// Steps 2–8 of §4.7: drop stale handles, claim the job, run it to a
/// terminal state, and always release the in-progress marker.
async fn execute_job(services: &Services, job_id: &JobId) {
    let record = match services.repo.read(job_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!("dequeued handle has no job record; dropping");
            return;
        }
        Err(err) => {
            warn!(error = %err, "could not read job record; dropping handle");
            return;
        }
    };

    if record.status != JobStatus::Queued {
        info!(status = record.status.as_str(), "handle is no longer queued; dropping");
        return;
    }

    if let Err(err) = services.repo.mark_in_progress(job_id).await {
        warn!(error = %err, "could not mark job in-progress; dropping handle");
        return;
    }

    run_job(services, job_id, &record).await;

    if let Err(err) = services.repo.unmark_in_progress(job_id).await {
        warn!(error = %err, "could not unmark in-progress set; recovery loop will reap on next start");
    }
}

async fn run_job(services: &Services, job_id: &JobId, record: &JobRecord) {
    let channel = progress_channel_key(&services.config.kv.key_prefix, job_id);

    let Some(request) = record.params() else {
        finalize_failed(
            services,
            job_id,
            &channel,
            "corrupt params_json".to_string(),
            Some("internal".to_string()),
            None,
        )
        .await;
        return;
    };

    if let Err(err) = services
        .repo
        .update_status(
            job_id,
            StatusUpdate {
                status: Some(JobStatus::Running),
                progress: Some(0.1),
                started_at: Some(chrono::Utc::now()),
                ..Default::default()
            },
        )
        .await
    {
        warn!(error = %err, "could not transition job to running");
        return;
    }
    publish(
        services,
        &channel,
        &ProgressEvent::Status {
            status: JobStatus::Running.as_str().to_string(),
            progress: 0.1,
        },
    )
    .await;

    let prompt = match services.backend.submit(&request).await {
        Ok(handle) => handle,
        Err(BackendError::Rejection(message)) => {
            finalize_failed(
                services,
                job_id,
                &channel,
                message,
                Some("backend_rejection".to_string()),
                None,
            )
            .await;
            return;
        }
        Err(err) => {
            finalize_failed(
                services,
                job_id,
                &channel,
                err.to_safe_string(),
                Some("backend_unavailable".to_string()),
                None,
            )
            .await;
            return;
        }
    };

    let images = match poll_until_terminal(services, job_id, &channel, &prompt.prompt_id).await {
        PollLoopResult::Succeeded(images) => images,
        PollLoopResult::Finalized => return,
    };

    let mut artifacts = Vec::with_capacity(images.len());
    for (index, image_ref) in images.iter().enumerate() {
        match transfer_artifact(services, job_id, index, image_ref, prompt.resolved_seed).await {
            Ok(artifact) => artifacts.push(artifact),
            Err(err) => {
                warn!(error = %err, "artifact transfer failed");
                finalize_failed(
                    services,
                    job_id,
                    &channel,
                    "artifact upload failed".to_string(),
                    Some("storage_unavailable".to_string()),
                    None,
                )
                .await;
                return;
            }
        }
    }

    let result = JobResult { artifacts };
    let finished_at = chrono::Utc::now();
    if let Err(err) = services
        .repo
        .update_status(
            job_id,
            StatusUpdate {
                status: Some(JobStatus::Succeeded),
                progress: Some(1.0),
                result: Some(result.clone()),
                finished_at: Some(finished_at),
                ..Default::default()
            },
        )
        .await
    {
        warn!(error = %err, "could not finalize succeeded job");
        return;
    }
    publish(
        services,
        &channel,
        &ProgressEvent::Done {
            status: JobStatus::Succeeded.as_str().to_string(),
            result: Some(result),
            error: None,
        },
    )
    .await;
    services.metrics.jobs_completed_total.with_label_values(&["succeeded"]).inc();
    observe_job_duration(services, record.queued_at, finished_at);
}

/// SPEC_FULL A.5's `job_duration_seconds` — wall clock from `queued_at` to
/// the terminal state reached, observed from every finalize path.
fn observe_job_duration(services: &Services, queued_at: chrono::DateTime<chrono::Utc>, finished_at: chrono::DateTime<chrono::Utc>) {
    let seconds = (finished_at - queued_at).num_milliseconds().max(0) as f64 / 1000.0;
    services.metrics.job_duration_seconds.observe(seconds);
}

enum PollLoopResult {
    Succeeded(Vec<ImageRef>),
    /// The job was already finalized (canceled, failed, or timed out) by
    /// this function; the caller must not finalize it again.
    Finalized,
}

/// Step 5 of §4.7: drives `backend::poll_to_completion` (the shared §4.3
/// backoff contract) with this job's cancel flag, deadline, and progress
/// publishing wired in, then finalizes whatever terminal it reaches.
async fn poll_until_terminal(
    services: &Services,
    job_id: &JobId,
    channel: &str,
    prompt_id: &str,
) -> PollLoopResult {
    let deadline = services.config.backend.job_timeout;

    let outcome = crate::backend::poll_to_completion(
        services.backend.as_ref(),
        prompt_id,
        deadline,
        || async { services.repo.cancel_requested(job_id).await.unwrap_or(false) },
        |fraction| async move {
            let scaled = 0.1 + fraction.clamp(0.0, 1.0) * 0.8;
            let _ = services
                .repo
                .update_status(job_id, StatusUpdate { progress: Some(scaled), ..Default::default() })
                .await;
            publish(services, channel, &ProgressEvent::Progress { progress: scaled, message: None }).await;
        },
        |latency| services.metrics.backend_poll_latency_seconds.observe(latency.as_secs_f64()),
    )
    .await;

    match outcome {
        Ok(PollToCompletionOutcome::Succeeded(images)) => PollLoopResult::Succeeded(images),
        Ok(PollToCompletionOutcome::Canceled) => {
            finalize_canceled(services, job_id, channel).await;
            PollLoopResult::Finalized
        }
        Err(BackendError::Timeout) => {
            finalize_failed(
                services,
                job_id,
                channel,
                "timeout".to_string(),
                Some("timeout".to_string()),
                Some(deadline.as_secs() as i64),
            )
            .await;
            PollLoopResult::Finalized
        }
        Err(BackendError::Rejection(message)) => {
            finalize_failed(
                services,
                job_id,
                channel,
                message,
                Some("backend_rejection".to_string()),
                None,
            )
            .await;
            PollLoopResult::Finalized
        }
        Err(err @ BackendError::Unavailable(_)) => {
            finalize_failed(
                services,
                job_id,
                channel,
                err.to_safe_string(),
                Some("backend_unavailable".to_string()),
                None,
            )
            .await;
            PollLoopResult::Finalized
        }
    }
}

async fn transfer_artifact(
    services: &Services,
    job_id: &JobId,
    index: usize,
    image_ref: &ImageRef,
    seed: i64,
) -> anyhow::Result<Artifact> {
    let bytes = services.backend.fetch_artifact(image_ref).await?;
    let key = format!("jobs/{}/image_{}.png", job_id.0, index);
    services.object_store.put_object(&key, bytes.bytes, "image/png").await?;
    let url = services
        .object_store
        .presign_get(&key, services.config.object_store.artifact_ttl)
        .await?;
    Ok(Artifact {
        url,
        width: bytes.width,
        height: bytes.height,
        seed: Some(seed),
        meta: None,
    })
}

async fn finalize_failed(
    services: &Services,
    job_id: &JobId,
    channel: &str,
    message: String,
    error_type: Option<String>,
    age_seconds: Option<i64>,
) {
    let error = JobErrorInfo { message, error_type, age_seconds };
    let _ = services
        .repo
        .update_status(
            job_id,
            StatusUpdate {
                status: Some(JobStatus::Failed),
                error: Some(error.clone()),
                finished_at: Some(chrono::Utc::now()),
                ..Default::default()
            },
        )
        .await;
    publish(
        services,
        channel,
        &ProgressEvent::Done {
            status: JobStatus::Failed.as_str().to_string(),
            result: None,
            error: Some(error),
        },
    )
    .await;
    services.metrics.jobs_completed_total.with_label_values(&["failed"]).inc();
}

async fn finalize_canceled(services: &Services, job_id: &JobId, channel: &str) {
    let error = JobErrorInfo {
        message: "canceled while running".to_string(),
        error_type: Some("canceled".to_string()),
        age_seconds: None,
    };
    let _ = services
        .repo
        .update_status(
            job_id,
            StatusUpdate {
                status: Some(JobStatus::Canceled),
                error: Some(error.clone()),
                finished_at: Some(chrono::Utc::now()),
                ..Default::default()
            },
        )
        .await;
    publish(
        services,
        channel,
        &ProgressEvent::Done {
            status: JobStatus::Canceled.as_str().to_string(),
            result: None,
            error: Some(error),
        },
    )
    .await;
    services.metrics.jobs_completed_total.with_label_values(&["canceled"]).inc();
}

async fn publish(services: &Services, channel: &str, event: &ProgressEvent) {
    let Ok(json) = serde_json::to_string(event) else { return };
    if let Err(err) = services.kv.publish(channel, &json).await {
        warn!(error = %err, "failed to publish progress event");
    }
}
