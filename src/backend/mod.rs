//! C3 — Backend Client: composes a workflow, submits it to a ComfyUI-shaped
//! HTTP backend, polls to completion, and fetches the resulting artifacts
//! (§4.3).

pub mod workflow;

use async_trait::async_trait;
use serde::Deserialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::errors::SafeDisplay;
use crate::model::GenerationRequest;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Deterministic 4xx from the backend — the job is not retryable as-is.
    #[error("backend rejected the request: {0}")]
    Rejection(String),
    /// Transport error or 5xx — the surrounding infrastructure may resubmit
    /// the whole job.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend poll deadline exceeded")]
    Timeout,
}

impl SafeDisplay for BackendError {
    fn to_safe_string(&self) -> String {
        match self {
            BackendError::Rejection(msg) => msg.clone(),
            BackendError::Unavailable(_) => "the generation backend is temporarily unavailable".to_string(),
            BackendError::Timeout => "the generation backend did not finish in time".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptHandle {
    pub prompt_id: String,
    pub resolved_seed: i64,
}

#[derive(Debug, Clone)]
pub struct ImageRef {
    pub filename: String,
    pub subfolder: String,
    pub image_type: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactBytes {
    pub bytes: Vec<u8>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Terminal or in-progress state observed from a single poll tick.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    Pending { progress: Option<f64> },
    Succeeded { images: Vec<ImageRef> },
    BackendFailed { message: String },
}

#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn submit(&self, request: &GenerationRequest) -> Result<PromptHandle, BackendError>;
    async fn poll_once(&self, prompt_id: &str) -> Result<PollOutcome, BackendError>;
    async fn fetch_artifact(&self, image_ref: &ImageRef) -> Result<ArtifactBytes, BackendError>;
    async fn health(&self) -> bool;
}

pub struct HttpBackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpBackendClient {
    pub fn new(base_url: String, submit_timeout: Duration, poll_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let _ = (submit_timeout, poll_timeout); // per-call timeouts applied at call sites below
        Ok(Self { http, base_url })
    }
}

#[derive(Debug, Deserialize)]
struct PromptResponse {
    prompt_id: String,
}

#[derive(Debug, Deserialize)]
struct HistoryOutputImage {
    filename: String,
    subfolder: String,
    #[serde(rename = "type")]
    image_type: String,
}

#[derive(Debug, Deserialize, Default)]
struct HistoryOutputs {
    #[serde(default)]
    images: Vec<HistoryOutputImage>,
}

#[derive(Debug, Deserialize, Default)]
struct HistoryStatus {
    #[serde(default)]
    completed: bool,
    #[serde(default)]
    status_str: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    outputs: std::collections::HashMap<String, HistoryOutputs>,
    #[serde(default)]
    status: Option<HistoryStatus>,
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn submit(&self, request: &GenerationRequest) -> Result<PromptHandle, BackendError> {
        let seed = workflow::resolve_seed(request);
        let client_id = uuid::Uuid::new_v4().to_string();
        let graph = workflow::compose(request, seed, &client_id);

        let response = tokio::time::timeout(
            Duration::from_secs(30),
            self.http.post(format!("{}/prompt", self.base_url)).json(&graph).send(),
        )
        .await
        .map_err(|_| BackendError::Unavailable("submission timed out".to_string()))?
        .map_err(|err| BackendError::Unavailable(err.to_string()))?;

        if response.status().is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Rejection(body));
        }
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Unavailable(body));
        }

        let parsed: PromptResponse = response
            .json()
            .await
            .map_err(|err| BackendError::Unavailable(err.to_string()))?;

        Ok(PromptHandle {
            prompt_id: parsed.prompt_id,
            resolved_seed: seed,
        })
    }

    async fn poll_once(&self, prompt_id: &str) -> Result<PollOutcome, BackendError> {
        let response = tokio::time::timeout(
            Duration::from_secs(10),
            self.http.get(format!("{}/history/{}", self.base_url, prompt_id)).send(),
        )
        .await
        .map_err(|_| BackendError::Unavailable("history poll timed out".to_string()))?
        .map_err(|err| BackendError::Unavailable(err.to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::Unavailable(format!(
                "history endpoint returned {}",
                response.status()
            )));
        }

        let history: std::collections::HashMap<String, HistoryEntry> = response
            .json()
            .await
            .map_err(|err| BackendError::Unavailable(err.to_string()))?;

        let Some(entry) = history.get(prompt_id) else {
            return Ok(PollOutcome::Pending { progress: None });
        };

        if let Some(status) = &entry.status {
            if !status.completed {
                if let Some(status_str) = &status.status_str {
                    if status_str == "error" {
                        return Ok(PollOutcome::BackendFailed {
                            message: "backend reported a generation error".to_string(),
                        });
                    }
                }
                return Ok(PollOutcome::Pending { progress: None });
            }
        }

        let images: Vec<ImageRef> = entry
            .outputs
            .values()
            .flat_map(|output| output.images.iter())
            .map(|image| ImageRef {
                filename: image.filename.clone(),
                subfolder: image.subfolder.clone(),
                image_type: image.image_type.clone(),
            })
            .collect();

        if images.is_empty() {
            return Ok(PollOutcome::BackendFailed {
                message: "completed history record has no output images".to_string(),
            });
        }

        Ok(PollOutcome::Succeeded { images })
    }

    async fn fetch_artifact(&self, image_ref: &ImageRef) -> Result<ArtifactBytes, BackendError> {
        let response = tokio::time::timeout(
            Duration::from_secs(60),
            self.http
                .get(format!("{}/view", self.base_url))
                .query(&[
                    ("filename", image_ref.filename.as_str()),
                    ("subfolder", image_ref.subfolder.as_str()),
                    ("type", image_ref.image_type.as_str()),
                ])
                .send(),
        )
        .await
        .map_err(|_| BackendError::Unavailable("artifact download timed out".to_string()))?
        .map_err(|err| BackendError::Unavailable(err.to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::Unavailable(format!(
                "artifact download returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| BackendError::Unavailable(err.to_string()))?
            .to_vec();

        if bytes.is_empty() {
            return Err(BackendError::Unavailable("empty artifact body".to_string()));
        }

        let (width, height) = png_dimensions(&bytes);

        Ok(ArtifactBytes { bytes, width, height })
    }

    async fn health(&self) -> bool {
        const ENDPOINTS: [&str; 3] = ["/queue", "/system_stats", "/"];

        for attempt in 1..=5u32 {
            for endpoint in ENDPOINTS {
                let result = tokio::time::timeout(
                    Duration::from_secs(5),
                    self.http.get(format!("{}{}", self.base_url, endpoint)).send(),
                )
                .await;

                if let Ok(Ok(response)) = result {
                    if response.status().is_success() {
                        return true;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(600 * u64::from(attempt))).await;
        }
        false
    }
}

/// Reads width/height out of a PNG's IHDR chunk without pulling in an image
/// decoding crate; we only need the declared dimensions, not pixel data.
fn png_dimensions(bytes: &[u8]) -> (Option<u32>, Option<u32>) {
    const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    if bytes.len() < 24 || bytes[0..8] != PNG_SIGNATURE {
        return (None, None);
    }
    let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    (Some(width), Some(height))
}

/// What `poll_to_completion` reached before returning `Ok`. A plain
/// `Err(BackendError)` covers the timeout/rejection terminals; this covers
/// the one terminal that isn't a backend error — a caller-requested
/// cancellation observed between ticks.
pub enum PollToCompletionOutcome {
    Succeeded(Vec<ImageRef>),
    Canceled,
}

/// Polls `client` to completion with the exponential-then-capped backoff of
/// §4.3 (start ~0.3s, cap ~2s). `should_cancel` is awaited once per tick
/// before polling; `on_progress` is awaited whenever the backend's reported
/// fraction changes; `on_poll_latency` is called synchronously with the
/// wall-clock time each `poll_once` call took. A transient poll error (a
/// transport/5xx `Err` from `poll_once`) is logged and retried rather than
/// failing the whole job — only a deterministic backend rejection or the
/// deadline elapsing ends the loop with an error.
pub async fn poll_to_completion<C, CFut, P, PFut, L>(
    client: &dyn BackendClient,
    prompt_id: &str,
    deadline: Duration,
    mut should_cancel: C,
    mut on_progress: P,
    mut on_poll_latency: L,
) -> Result<PollToCompletionOutcome, BackendError>
where
    C: FnMut() -> CFut + Send,
    CFut: Future<Output = bool> + Send,
    P: FnMut(f64) -> PFut + Send,
    PFut: Future<Output = ()> + Send,
    L: FnMut(Duration) + Send,
{
    let start = Instant::now();
    let mut interval = Duration::from_millis(300);
    const CAP: Duration = Duration::from_millis(2000);
    let mut last_progress = 0.0;

    loop {
        if should_cancel().await {
            return Ok(PollToCompletionOutcome::Canceled);
        }

        if start.elapsed() > deadline {
            return Err(BackendError::Timeout);
        }

        let poll_started = Instant::now();
        let outcome = client.poll_once(prompt_id).await;
        on_poll_latency(poll_started.elapsed());

        match outcome {
            Ok(PollOutcome::Succeeded { images }) => return Ok(PollToCompletionOutcome::Succeeded(images)),
            Ok(PollOutcome::BackendFailed { message }) => return Err(BackendError::Rejection(message)),
            Ok(PollOutcome::Pending { progress }) => {
                if let Some(progress) = progress {
                    if (progress - last_progress).abs() > f64::EPSILON {
                        last_progress = progress;
                        on_progress(progress).await;
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "poll tick failed; retrying next tick");
            }
        }

        tokio::time::sleep(interval).await;
        interval = std::cmp::min(interval * 2, CAP);
    }
}
