//! Wire and persistence types: the generation request schema (§6.2), the job
//! record (§3), and the HTTP response shapes (§6.3).

use chrono::{DateTime, Utc};
use poem_openapi::{Enum, Object, Union};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque job identifier, `j_` + 12 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 6];
        use rand::RngCore;
        rand::rng().fill_bytes(&mut bytes);
        JobId(format!("j_{}", hex::encode(bytes)))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Canceling,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Canceling => "canceling",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "canceling" => Ok(JobStatus::Canceling),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum Sampler {
    Euler,
    EulerAncestral,
    Heun,
    Dpm2,
    Dpm2Ancestral,
    Lms,
    DpmFast,
    DpmAdaptive,
    Dpmpp2sAncestral,
    Dpmpp2m,
    DpmppSde,
    Ddim,
    Plms,
    UniPc,
}

impl Default for Sampler {
    fn default() -> Self {
        Sampler::EulerAncestral
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum Role {
    Free,
    Pro,
    Internal,
}

/// Per-role (daily, concurrent, per-minute) triple, §4.5/§6.5 `role_quotas`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleQuota {
    pub daily_limit: u32,
    pub concurrent_limit: u32,
    pub per_minute_limit: u32,
    pub max_batch_size: u32,
}

impl RoleQuota {
    pub fn unlimited(&self) -> bool {
        self.daily_limit == u32::MAX
    }
}

/// The validated generation request, §6.2. Constructed only via [`GenerationRequest::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f64,
    #[serde(default)]
    pub sampler: Sampler,
    #[serde(default = "default_seed")]
    pub seed: i64,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_num_images")]
    pub num_images: u32,
}

fn default_width() -> u32 {
    512
}
fn default_height() -> u32 {
    512
}
fn default_steps() -> u32 {
    20
}
fn default_cfg_scale() -> f64 {
    7.0
}
fn default_seed() -> i64 {
    -1
}
fn default_model() -> String {
    "v1-5-pruned-emaonly.ckpt".to_string()
}
fn default_num_images() -> u32 {
    1
}

/// A single validation failure: offending field and the constraint it broke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub constraint: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.constraint)
    }
}

impl GenerationRequest {
    /// Validates per §6.2. Returns the offending fields on failure; never
    /// partially applies a mutation (defaults are filled by `serde(default)`
    /// before this runs).
    pub fn validate(&self, max_batch_size: u32) -> Result<(), Vec<FieldViolation>> {
        let mut violations = Vec::new();

        if self.prompt.is_empty() || self.prompt.chars().count() > 4000 {
            violations.push(FieldViolation {
                field: "prompt".into(),
                constraint: "must be 1..4000 chars".into(),
            });
        }
        if let Some(neg) = &self.negative_prompt {
            if neg.chars().count() > 4000 {
                violations.push(FieldViolation {
                    field: "negative_prompt".into(),
                    constraint: "must be 0..4000 chars".into(),
                });
            }
        }
        if !(64..=2048).contains(&self.width) || self.width % 8 != 0 {
            violations.push(FieldViolation {
                field: "width".into(),
                constraint: "must be 64..2048 and a multiple of 8".into(),
            });
        }
        if !(64..=2048).contains(&self.height) || self.height % 8 != 0 {
            violations.push(FieldViolation {
                field: "height".into(),
                constraint: "must be 64..2048 and a multiple of 8".into(),
            });
        }
        if !(1..=150).contains(&self.steps) {
            violations.push(FieldViolation {
                field: "steps".into(),
                constraint: "must be 1..150".into(),
            });
        }
        if !(1.0..=30.0).contains(&self.cfg_scale) {
            violations.push(FieldViolation {
                field: "cfg_scale".into(),
                constraint: "must be 1.0..30.0".into(),
            });
        }
        if self.seed < -1 || self.seed > i64::from(i32::MAX) {
            violations.push(FieldViolation {
                field: "seed".into(),
                constraint: "must be -1 or an int32 in [0, 2^31-1]".into(),
            });
        }
        if !(1..=max_batch_size).contains(&self.num_images) {
            violations.push(FieldViolation {
                field: "num_images".into(),
                constraint: format!("must be 1..{max_batch_size} for this role"),
            });
        }
        if u64::from(self.width) * u64::from(self.height) > 4_000_000 {
            violations.push(FieldViolation {
                field: "width,height".into(),
                constraint: "width*height must not exceed 4_000_000".into(),
            });
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    /// Canonical JSON (sorted keys) used for idempotency-key derivation.
    pub fn canonical_json(&self) -> String {
        let value = serde_json::to_value(self).expect("GenerationRequest always serializes");
        let sorted: BTreeMap<String, serde_json::Value> = value
            .as_object()
            .expect("object")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        serde_json::to_string(&sorted).expect("sorted map always serializes")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct Artifact {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub seed: Option<i64>,
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct JobResult {
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct JobErrorInfo {
    pub message: String,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub age_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobTimestamps {
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The persisted job record, §3. Lives at `P:jobs:{job_id}` as a hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: f64,
    pub owner_token: String,
    pub idempotency_key: String,
    pub params_json: String,
    pub result_json: Option<String>,
    pub error_json: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub protocol_version: String,
}

pub const PROTOCOL_VERSION: &str = "v1";

impl JobRecord {
    pub fn new(job_id: JobId, owner_token: String, idempotency_key: String, params_json: String) -> Self {
        Self {
            job_id,
            status: JobStatus::Queued,
            progress: 0.0,
            owner_token,
            idempotency_key,
            params_json,
            result_json: None,
            error_json: None,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn result(&self) -> Option<JobResult> {
        self.result_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }

    pub fn error(&self) -> Option<JobErrorInfo> {
        self.error_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }

    pub fn params(&self) -> Option<GenerationRequest> {
        serde_json::from_str(&self.params_json).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct SubmitResponse {
    pub job_id: String,
    pub status: String,
    pub queued_at: DateTime<Utc>,
    pub location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct StatusResponse {
    pub job_id: String,
    pub status: String,
    pub progress: f64,
    pub submitted_by: String,
    pub params: GenerationRequest,
    pub result: Option<JobResult>,
    pub error: Option<JobErrorInfo>,
    pub timestamps: JobTimestamps,
}

impl StatusResponse {
    pub fn from_record(record: &JobRecord) -> Option<Self> {
        Some(Self {
            job_id: record.job_id.0.clone(),
            status: record.status.as_str().to_string(),
            progress: record.progress,
            submitted_by: record.owner_token.clone(),
            params: record.params()?,
            result: record.result(),
            error: record.error(),
            timestamps: JobTimestamps {
                queued_at: record.queued_at,
                started_at: record.started_at,
                finished_at: record.finished_at,
            },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct CancelResponse {
    pub job_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct JobListResponse {
    pub jobs: Vec<StatusResponse>,
    pub next_cursor: Option<String>,
}

/// Frame shape published on the per-job progress channel, §3/§4.8.
#[derive(Debug, Clone, Serialize, Deserialize, Union)]
#[serde(tag = "type", rename_all = "snake_case")]
#[oai(discriminator_name = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Status {
        status: String,
        progress: f64,
    },
    Progress {
        progress: f64,
        message: Option<String>,
    },
    Done {
        status: String,
        result: Option<JobResult>,
        error: Option<JobErrorInfo>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct HealthcheckResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct VersionInfo {
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GenerationRequest {
        GenerationRequest {
            prompt: "sunset".to_string(),
            negative_prompt: None,
            width: 512,
            height: 512,
            steps: 20,
            cfg_scale: 7.0,
            sampler: Sampler::EulerAncestral,
            seed: -1,
            model: default_model(),
            num_images: 1,
        }
    }

    #[test]
    fn defaults_pass_validation() {
        assert!(sample().validate(4).is_ok());
    }

    #[test]
    fn width_not_a_multiple_of_8_is_rejected() {
        let mut request = sample();
        request.width = 513;
        let violations = request.validate(4).unwrap_err();
        assert!(violations.iter().any(|v| v.field == "width"));
    }

    #[test]
    fn area_over_four_megapixels_is_rejected_even_with_in_range_dimensions() {
        let mut request = sample();
        request.width = 2048;
        request.height = 2048;
        let violations = request.validate(4).unwrap_err();
        assert!(violations.iter().any(|v| v.field == "width,height"));
    }

    #[test]
    fn num_images_over_the_role_batch_cap_is_rejected() {
        let mut request = sample();
        request.num_images = 2;
        let violations = request.validate(1).unwrap_err();
        assert!(violations.iter().any(|v| v.field == "num_images"));
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let mut request = sample();
        request.prompt = String::new();
        let violations = request.validate(4).unwrap_err();
        assert!(violations.iter().any(|v| v.field == "prompt"));
    }

    #[test]
    fn seed_outside_int32_range_is_rejected() {
        let mut request = sample();
        request.seed = i64::from(i32::MAX) + 1;
        let violations = request.validate(4).unwrap_err();
        assert!(violations.iter().any(|v| v.field == "seed"));
    }

    #[test]
    fn canonical_json_is_order_independent_of_struct_field_order() {
        // `canonical_json` sorts keys, so two requests differing only in
        // which field was mutated last still serialize identically when the
        // field values are equal.
        let a = sample();
        let mut b = sample();
        b.steps = 20; // no-op mutation, same effective value
        assert_eq!(a.canonical_json(), b.canonical_json());
    }

    #[test]
    fn canonical_json_changes_when_a_field_changes() {
        let a = sample();
        let mut b = sample();
        b.steps = 21;
        assert_ne!(a.canonical_json(), b.canonical_json());
    }

    #[test]
    fn job_id_has_the_j_prefix_and_twelve_hex_chars() {
        let id = JobId::generate();
        assert!(id.0.starts_with("j_"));
        assert_eq!(id.0.len(), 2 + 12);
        assert!(id.0[2..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn succeeded_status_is_the_only_terminal_status_with_progress_one() {
        // Property 3 (§8): status == succeeded iff progress == 1.0 is a
        // repository/worker-level invariant, not something JobStatus itself
        // enforces structurally — but terminality must still line up with
        // the state machine's three terminal states.
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Canceling,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Canceled,
        ] {
            let expected_terminal = matches!(
                status,
                JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
            );
            assert_eq!(status.is_terminal(), expected_terminal);
        }
    }

    #[test]
    fn job_status_round_trips_through_its_string_form() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Canceling,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Canceled,
        ] {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    proptest::proptest! {
        /// Property 9 (§8), positive side: any width/height pair that is
        /// in-range, a multiple of 8, and within the 4-megapixel area cap
        /// always validates.
        #[test]
        fn in_range_multiple_of_eight_dimensions_always_validate(
            w_step in 8u32..=256,
            h_step in 8u32..=256,
        ) {
            let mut request = sample();
            request.width = w_step * 8;
            request.height = h_step * 8;
            if u64::from(request.width) * u64::from(request.height) <= 4_000_000 {
                prop_assert!(request.validate(4).is_ok());
            }
        }

        /// Property 9 (§8), negative side: a width that isn't a multiple of
        /// 8 is always rejected, regardless of what else varies.
        #[test]
        fn non_multiple_of_eight_width_is_always_rejected(offset in 1u32..8) {
            let mut request = sample();
            request.width = 512 + offset;
            let violations = request.validate(4).unwrap_err();
            prop_assert!(violations.iter().any(|v| v.field == "width"));
        }
    }
}
