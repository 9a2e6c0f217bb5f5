use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// # NDOC
/// component: `contracts`
/// purpose: Standard result alias for pipeline and client operations.
pub type JobResult<T> = Result<T, JobError>;

/// # NDOC
/// component: `contracts`
/// purpose: Stable machine-readable error category.
/// invariants:
///   - Variants are written into `job_runs.error_log`; changes require
///     compatibility review.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Retryable upstream failure: 5xx, 429, connection reset, timeout.
    TransientHttp,
    /// 401 after the single refresh attempt (or with no refresh token).
    AuthExpired,
    /// AI-API rate limit or quota; the run continues without that modality.
    QuotaExceeded,
    /// Missing upstream entity; the item is skipped.
    NotFound,
    /// Bad stored configuration; the tenant is skipped.
    Validation,
    /// Store unreachable or equally unrecoverable; aborts the pipeline.
    Fatal,
}

/// # NDOC
/// component: `contracts`
/// purpose: Canonical error payload recorded in job-run and audit rows.
/// invariants:
///   - `message` is safe to persist and display.
///   - `retryable` indicates whether an automated retry already made sense
///     at the call site; callers above the client layer must not retry.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
    pub retryable: bool,
    pub details: Option<Value>,
}

impl JobError {
    pub fn new(
        kind: JobErrorKind,
        message: impl Into<String>,
        retryable: bool,
        details: Option<Value>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
            details,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::TransientHttp, message, true, None)
    }

    pub fn auth_expired(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::AuthExpired, message, false, None)
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::QuotaExceeded, message, false, None)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::NotFound, message, false, None)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Validation, message, false, None)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Fatal, message, false, None)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == JobErrorKind::Fatal
    }

    /// Flattens the error into the shape stored in `job_runs.error_log`.
    pub fn to_log_entry(&self, tenant: Option<&str>) -> Value {
        let mut entry = serde_json::Map::new();
        if let Some(tenant) = tenant {
            entry.insert("tenant".into(), Value::String(tenant.to_string()));
        }
        entry.insert(
            "kind".into(),
            serde_json::to_value(&self.kind).unwrap_or(Value::Null),
        );
        entry.insert("error".into(), Value::String(self.message.clone()));
        if let Some(details) = &self.details {
            entry.insert("details".into(), details.clone());
        }
        Value::Object(entry)
    }
}

impl From<reqwest::Error> for JobError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() || value.is_connect() {
            JobError::transient(value.to_string())
        } else if let Some(status) = value.status() {
            match status.as_u16() {
                401 => JobError::auth_expired(value.to_string()),
                404 => JobError::not_found(value.to_string()),
                429 | 500..=599 => JobError::transient(value.to_string()),
                _ => JobError::new(JobErrorKind::TransientHttp, value.to_string(), false, None),
            }
        } else {
            JobError::transient(value.to_string())
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(value: serde_json::Error) -> Self {
        JobError::validation(value.to_string())
    }
}

impl From<std::io::Error> for JobError {
    fn from(value: std::io::Error) -> Self {
        JobError::new(JobErrorKind::Fatal, value.to_string(), false, None)
    }
}
