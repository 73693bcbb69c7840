//! Error types for the sync engine
//!
//! Errors are classified by how the engine reacts to them:
//! - Transient: rate limits, 5xx, network failures. Retried with backoff.
//! - UpstreamClient: any other non-2xx from a provider. Never retried.
//! - NotFound: a referenced record or event is gone. Recovered locally.
//! - ValidationGap: a single item is unusable. Skipped, batch continues.
//! - Fatal: missing credentials, storage failure. Aborts the operation.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::db::DbError;

#[derive(Debug, Error)]
pub enum SyncError {
    // Transient
    #[error("Upstream temporarily unavailable ({status:?}): {message}")]
    TransientUpstream { status: Option<u16>, message: String },

    #[error("Fetch failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    // Non-retryable upstream
    #[error("Upstream rejected request ({status}): {message}")]
    UpstreamClient { status: u16, message: String },

    #[error("Missing credential: {0}")]
    MissingCredential(String),

    #[error("Calendar error: {0}")]
    Calendar(String),

    // Recovered locally
    #[error("Not found: {0}")]
    NotFound(String),

    // Validation gaps
    #[error("Task {0} has no due date")]
    MissingDueDate(String),

    #[error("Malformed recurrence on template {template_id}: {reason}")]
    MalformedRecurrence { template_id: String, reason: String },

    #[error("Task {0} is a recurring template and is never put on the calendar")]
    NotExportable(String),

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Calendar sync is not enabled")]
    SyncDisabled,

    #[error("Failed to decode upstream payload: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // Storage
    #[error("Storage error: {0}")]
    Store(#[from] DbError),
}

/// Coarse bucket of an error, reported alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Transient,
    UpstreamClient,
    NotFound,
    ValidationGap,
    Fatal,
}

impl SyncError {
    /// Returns true if repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientUpstream { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::TransientUpstream { .. } | SyncError::RetriesExhausted { .. } => {
                ErrorKind::Transient
            }
            SyncError::UpstreamClient { .. } | SyncError::Calendar(_) | SyncError::Decode(_) => {
                ErrorKind::UpstreamClient
            }
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::MissingDueDate(_)
            | SyncError::MalformedRecurrence { .. }
            | SyncError::NotExportable(_)
            | SyncError::Invalid(_)
            | SyncError::SyncDisabled => ErrorKind::ValidationGap,
            SyncError::MissingCredential(_) | SyncError::Config(_) | SyncError::Store(_) => {
                ErrorKind::Fatal
            }
        }
    }

    /// Get a user-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            SyncError::TransientUpstream { .. } | SyncError::RetriesExhausted { .. } => {
                "The provider is busy or unreachable. The next scheduled run will retry."
            }
            SyncError::UpstreamClient { .. } => {
                "Check the tracker view id and credential in your configuration."
            }
            SyncError::MissingCredential(_) => {
                "Set ROUTINE_SYNC_TRACKER_TOKEN / ROUTINE_SYNC_CALENDAR_TOKEN in the environment."
            }
            SyncError::Calendar(_) => "Check the calendar id in your sync settings.",
            SyncError::NotFound(_) => "The item may have been deleted. Refresh and try again.",
            SyncError::MissingDueDate(_) => "Give the task a due date before exporting it.",
            SyncError::MalformedRecurrence { .. } => {
                "Edit the recurring task and pick at least one valid weekday."
            }
            SyncError::NotExportable(_) => "Export one of its dated instances instead.",
            SyncError::Invalid(_) => "Correct the highlighted field and try again.",
            SyncError::SyncDisabled => "Enable calendar sync in settings first.",
            SyncError::Decode(_) => "The provider returned an unexpected payload.",
            SyncError::Config(_) => "Fix or remove ~/.routine-sync/config.json and restart.",
            SyncError::Store(_) => "Check database file permissions and disk space.",
        }
    }
}

/// Serializable error representation for callers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub message: String,
    pub kind: ErrorKind,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

impl From<&SyncError> for ErrorInfo {
    fn from(err: &SyncError) -> Self {
        ErrorInfo {
            message: err.to_string(),
            kind: err.kind(),
            can_retry: err.is_retryable() || err.kind() == ErrorKind::Transient,
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}

/// Timing metadata attached to every response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    pub fn_name: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Uniform result envelope of the public surface.
///
/// Either `data` or `error` is set; `ok` says which.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
    pub meta: ResponseMeta,
}

impl<T> ApiResponse<T> {
    pub fn from_result(fn_name: &str, started: Instant, result: Result<T, SyncError>) -> Self {
        let meta = ResponseMeta {
            fn_name: fn_name.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        };
        match result {
            Ok(data) => {
                log::debug!("[{}] ok in {}ms", fn_name, meta.duration_ms);
                Self {
                    ok: true,
                    data: Some(data),
                    error: None,
                    error_info: None,
                    meta,
                }
            }
            Err(err) => {
                log::warn!("[{}] failed: {}", fn_name, err);
                Self {
                    ok: false,
                    data: None,
                    error: Some(err.to_string()),
                    error_info: Some(ErrorInfo::from(&err)),
                    meta,
                }
            }
        }
    }
}
