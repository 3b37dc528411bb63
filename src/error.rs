//! 统一的 API 错误类型与转换。

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::chunk_store::ChunkStoreError;
use crate::coordinator::UploadError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
    MergeFailed {
        reason: String,
        missing_index: Option<u32>,
    },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
            ApiError::MergeFailed {
                reason,
                missing_index,
            } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "message": "merge failed, chunks kept for retry",
                    "error": reason,
                    "missingIndex": missing_index,
                })),
            )
                .into_response(),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::Validation(msg) => ApiError::BadRequest(msg),
            UploadError::Busy(_) => ApiError::Conflict(error.to_string()),
            UploadError::NotFound(_) => ApiError::NotFound(error.to_string()),
            UploadError::Storage(msg) => ApiError::Internal(msg),
            UploadError::Merge {
                reason,
                missing_index,
            } => ApiError::MergeFailed {
                reason,
                missing_index,
            },
        }
    }
}

impl From<ChunkStoreError> for ApiError {
    fn from(error: ChunkStoreError) -> Self {
        UploadError::from(error).into()
    }
}
