//! Error taxonomy / 错误分类
//!
//! Validation and binding errors are raised locally and never reach a provider.
//! Transfer errors are retried per part; the terminal report is `TransferFailed`.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::reference::ObjectReference;

/// Object reference / ttl validation failures / 校验错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid base directory {0:?}: must be non-empty and must not contain path separators")]
    InvalidBaseDirectory(String),

    #[error("invalid relative directory {value:?}: {reason}")]
    InvalidRelativeDirectory { value: String, reason: String },

    #[error("invalid object name {0:?}: must be non-empty and must not contain path separators")]
    InvalidObjectName(String),

    #[error("invalid ttl: {0}")]
    InvalidTtl(String),
}

/// Provider selection failures, fatal at startup / 绑定错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("binding conflict for {capability}: already bound to {existing}, refusing {requested}")]
    BindingConflict {
        capability: String,
        existing: String,
        requested: String,
    },

    #[error("unrecognized provider selector: {0}")]
    UnrecognizedSelector(String),

    #[error("invalid settings for provider {provider}: {reason}")]
    InvalidSettings { provider: String, reason: String },

    #[error("no provider bound for {0}")]
    MissingCapability(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error(
        "transfer of {reference} failed{}{}: {last_error}{}",
        .part_number.map(|p| format!(" at part {}", p)).unwrap_or_default(),
        .status.map(|s| format!(" (status {})", s)).unwrap_or_default(),
        .cleanup_error.as_ref().map(|c| format!("; abort also failed: {}", c)).unwrap_or_default()
    )]
    TransferFailed {
        reference: ObjectReference,
        part_number: Option<u32>,
        status: Option<u16>,
        last_error: String,
        cleanup_error: Option<String>,
    },

    #[error("authorization expired at {expired_at}, request a new transfer config")]
    ExpiredAuthorization { expired_at: DateTime<Utc> },

    #[error("authorization grants {granted} access, {requested} was attempted")]
    OperationMismatch { granted: String, requested: String },

    #[error("transfer of {reference} was cancelled")]
    Cancelled { reference: ObjectReference },

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("provider error{}: {message}", .status.map(|s| format!(" (status {})", s)).unwrap_or_default())]
    Provider { status: Option<u16>, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn provider(message: impl Into<String>) -> Self {
        StorageError::Provider {
            status: None,
            message: message.into(),
        }
    }

    /// Whether the caller may re-request a config and restart / 是否可以重新申请配置后重试
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            StorageError::TransferFailed { .. }
                | StorageError::ExpiredAuthorization { .. }
                | StorageError::Cancelled { .. }
        )
    }
}

/// Classification of a single provider request failure / 单次请求失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartErrorKind {
    Retryable,
    Fatal,
    Expired,
}

/// Failure of one provider request (part upload, range read, complete, abort)
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PartError {
    pub status: Option<u16>,
    pub message: String,
    pub kind: PartErrorKind,
}

impl PartError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            kind: PartErrorKind::Retryable,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            kind: PartErrorKind::Fatal,
        }
    }

    /// Classify an HTTP failure by status and response body / 按状态码和响应体分类
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            408 | 429 | 500..=599 => PartErrorKind::Retryable,
            403 if is_expiry_message(body) => PartErrorKind::Expired,
            _ => PartErrorKind::Fatal,
        };
        let snippet: String = body.chars().take(256).collect();
        Self {
            status: Some(status),
            message: format!("provider returned {}: {}", status, snippet),
            kind,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == PartErrorKind::Retryable
    }
}

impl From<reqwest::Error> for PartError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => PartError::from_status(status.as_u16(), &e.to_string()),
            // connect / timeout / body errors
            None => PartError::retryable(e.to_string()),
        }
    }
}

/// S3 says "Request has expired", Azure "Signed expiry time ... must be after signed start time"
/// or "AuthenticationFailed ... expired".
fn is_expiry_message(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("expired") || lower.contains("signed expiry time")
}
