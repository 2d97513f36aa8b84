//! Error taxonomy shared by the queue, the worker, and the HTTP surface.

use serde_json::Value;
use thiserror::Error;

/// Errors produced while admitting, locating, or executing export jobs.
///
/// Every variant maps to a stable machine-readable [`code`](ExportError::code)
/// that ends up in API error bodies and in the `error` block of a failed
/// job's terminal snapshot.
#[derive(Debug, Clone, Error)]
pub enum ExportError {
    /// The enqueue payload was rejected before a job was created.
    #[error("{message}")]
    Validation {
        code: &'static str,
        message: String,
        details: Option<Value>,
    },

    /// No job matched the request.
    #[error("{0}")]
    NotFound(String),

    /// Transient transport failures outlasted the retry budget.
    #[error("network error: {0}")]
    Network(String),

    /// The transport reported an authentication or authorization failure.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The transport rejected the request with a non-auth client error.
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Cancellation was observed at a checkpoint.
    #[error("export cancelled by user")]
    Cancelled,

    /// Anything else the orchestration could not handle.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExportError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn validation_with_details(
        code: &'static str,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        Self::Validation {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Stable snake_case identifier for this error.
    pub fn code(&self) -> &'static str {
        match self {
            ExportError::Validation { code, .. } => code,
            ExportError::NotFound(_) => "not_found",
            ExportError::Network(_) => "network_error",
            ExportError::Auth(_) => "auth_error",
            ExportError::Rejected { .. } => "request_rejected",
            ExportError::Cancelled => "export_cancelled",
            ExportError::Internal(_) => "internal_error",
        }
    }

    /// Extra structured context, if any.
    pub fn details(&self) -> Option<&Value> {
        match self {
            ExportError::Validation { details, .. } => details.as_ref(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExportError::Cancelled)
    }
}

pub type Result<T, E = ExportError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ExportError::NotFound("x".into()).code(), "not_found");
        assert_eq!(ExportError::Network("x".into()).code(), "network_error");
        assert_eq!(ExportError::Auth("x".into()).code(), "auth_error");
        assert_eq!(ExportError::Cancelled.code(), "export_cancelled");
        assert_eq!(ExportError::internal("boom").code(), "internal_error");
        assert_eq!(
            ExportError::Rejected {
                status: 404,
                message: "missing".into()
            }
            .code(),
            "request_rejected"
        );
    }

    #[test]
    fn test_validation_carries_code_and_details() {
        let err = ExportError::validation_with_details(
            "invalid_format",
            "Unsupported format(s): docx",
            json!({ "unsupported": ["docx"] }),
        );
        assert_eq!(err.code(), "invalid_format");
        assert_eq!(err.to_string(), "Unsupported format(s): docx");
        assert_eq!(err.details(), Some(&json!({ "unsupported": ["docx"] })));
    }
}
