use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use facelink_core::{CompareError, DetectionFailure, ImageError};
use facelink_store::AssetError;
use serde_json::json;
use thiserror::Error;

use crate::engine::EngineError;

/// Every failure a handler can surface, rendered as `{"error": ...}`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Only POST method allowed")]
    MethodNotAllowed,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(%status, error = %self, "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        match rejection {
            JsonRejection::MissingJsonContentType(_) => {
                ApiError::BadRequest("No JSON data provided".into())
            }
            other => {
                tracing::debug!(error = %other.body_text(), "json rejected");
                ApiError::BadRequest("Invalid JSON".into())
            }
        }
    }
}

impl From<CompareError> for ApiError {
    fn from(err: CompareError) -> Self {
        match err {
            CompareError::EmptyEmbedding => ApiError::BadRequest("Both embeddings required".into()),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl From<ImageError> for ApiError {
    fn from(err: ImageError) -> Self {
        match err {
            ImageError::EmptyData => ApiError::BadRequest("No image provided".into()),
            ImageError::EncodeFailed(msg) => ApiError::Internal(format!("failed to encode image: {msg}")),
            other => {
                tracing::debug!(error = %other, "image payload rejected");
                ApiError::BadRequest("Invalid image format".into())
            }
        }
    }
}

impl From<AssetError> for ApiError {
    fn from(err: AssetError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Internal(format!("Embedding engine unavailable: {err}"))
    }
}

/// Scratch-file failures only; `NoFace` is a business outcome, handled by
/// the detect handler.
impl From<DetectionFailure> for ApiError {
    fn from(err: DetectionFailure) -> Self {
        ApiError::Internal(err.to_string())
    }
}
