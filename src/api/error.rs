use crate::error::ExportError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

/// JSON body of every error response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Error type for HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Export(#[from] ExportError),

    /// The body could not be decoded at all.
    #[error("Invalid request body: {0}")]
    InvalidPayload(String),

    /// Nothing has been published for the requested job yet.
    #[error("{0}")]
    NoProgress(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Export(err) => match &err {
                ExportError::Validation { .. } => (
                    StatusCode::BAD_REQUEST,
                    ErrorBody {
                        error: err.to_string(),
                        code: err.code().to_string(),
                        details: err.details().cloned(),
                    },
                ),
                ExportError::NotFound(message) => (
                    StatusCode::NOT_FOUND,
                    ErrorBody {
                        error: message.clone(),
                        code: err.code().to_string(),
                        details: None,
                    },
                ),
                _ => {
                    tracing::error!(error = %err, code = err.code(), "Request failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        ErrorBody {
                            error: "An internal error occurred".to_string(),
                            code: "internal_error".to_string(),
                            details: None,
                        },
                    )
                }
            },
            ApiError::InvalidPayload(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: message,
                    code: "invalid_payload".to_string(),
                    details: None,
                },
            ),
            ApiError::NoProgress(message) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    error: message,
                    code: "not_found".to_string(),
                    details: None,
                },
            ),
        };

        (status, Json(body)).into_response()
    }
}
