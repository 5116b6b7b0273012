//! Shared error-surface primitives used across every component.
//!
//! Mirrors the split Golem Cloud's services use between `Display`/`Debug`
//! (safe for internal logs, may carry upstream error text) and the string
//! actually returned to a caller over HTTP.

use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, Object};
use serde::{Deserialize, Serialize};

use crate::auth::AuthError;
use crate::backend::BackendError;
use crate::kv::KvError;
use crate::model::FieldViolation;
use crate::rate_limit::{QuotaKind, RateLimitError};
use crate::repo::RepoError;
use crate::storage::StorageError;

/// A type that can render itself in a form safe to return to an end user.
///
/// `Display`/`Debug` may leak internal detail (backend stack traces, SQL
/// fragments, presigned URL query strings); `to_safe_string` never does.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub details: Option<Vec<String>>,
    pub request_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ErrorDetail {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
            request_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = Some(details);
        self
    }
}

impl ErrorBody {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail::new(code, message),
        }
    }
}

/// The unified HTTP error surface of §7, one variant per status code the
/// submission API can return.
#[derive(ApiResponse, Debug, Clone)]
pub enum ApiError {
    #[oai(status = 422)]
    ValidationError(Json<ErrorBody>),
    #[oai(status = 401)]
    Unauthorized(Json<ErrorBody>),
    #[oai(status = 403)]
    Forbidden(Json<ErrorBody>),
    #[oai(status = 429)]
    RateLimited(Json<ErrorBody>, #[oai(header = "Retry-After")] u64),
    #[oai(status = 402)]
    QuotaExceeded(Json<ErrorBody>),
    #[oai(status = 404)]
    NotFound(Json<ErrorBody>),
    #[oai(status = 503)]
    BackendUnavailable(Json<ErrorBody>),
    #[oai(status = 500)]
    InternalError(Json<ErrorBody>),
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(Json(ErrorBody::new("NOT_FOUND", message)))
    }

    pub fn validation(violations: &[FieldViolation]) -> Self {
        let details = violations.iter().map(|v| v.to_string()).collect();
        ApiError::ValidationError(Json(
            ErrorBody::new("VALIDATION_ERROR", "the request failed validation").with_details(details),
        ))
    }
}

impl From<Vec<FieldViolation>> for ApiError {
    fn from(violations: Vec<FieldViolation>) -> Self {
        ApiError::validation(&violations)
    }
}

impl From<RateLimitError> for ApiError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::RateLimited { retry_after_seconds } => ApiError::RateLimited(
                Json(ErrorBody::new("RATE_LIMIT_EXCEEDED", err.to_safe_string())),
                retry_after_seconds,
            ),
            RateLimitError::QuotaExceeded { kind } => {
                let code = match kind {
                    QuotaKind::Daily => "QUOTA_EXCEEDED",
                    QuotaKind::Concurrent => "QUOTA_EXCEEDED",
                };
                ApiError::QuotaExceeded(Json(ErrorBody::new(code, err.to_safe_string())))
            }
            RateLimitError::Unavailable(_) => {
                ApiError::InternalError(Json(ErrorBody::new("INTERNAL_ERROR", err.to_safe_string())))
            }
        }
    }
}

impl From<RepoError> for ApiError {
    fn from(err: RepoError) -> Self {
        ApiError::InternalError(Json(ErrorBody::new("INTERNAL_ERROR", err.to_safe_string())))
    }
}

impl From<KvError> for ApiError {
    fn from(err: KvError) -> Self {
        ApiError::InternalError(Json(ErrorBody::new("INTERNAL_ERROR", err.to_safe_string())))
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError::InternalError(Json(ErrorBody::new("INTERNAL_ERROR", err.to_safe_string())))
    }
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        ApiError::BackendUnavailable(Json(ErrorBody::new("BACKEND_UNAVAILABLE", err.to_safe_string())))
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthorized => {
                ApiError::Unauthorized(Json(ErrorBody::new("UNAUTHORIZED", err.to_string())))
            }
            AuthError::Forbidden => ApiError::Forbidden(Json(ErrorBody::new("FORBIDDEN", err.to_string()))),
        }
    }
}
