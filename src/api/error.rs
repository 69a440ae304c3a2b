use crate::models::{ApiErrorBody, ErrorCode};
use crate::services::error::UploadError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Upload(#[from] UploadError),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Upload(e) => match e {
                UploadError::InvalidDestination(_)
                | UploadError::InvalidChunkIndex { .. }
                | UploadError::ChecksumMismatch { .. }
                | UploadError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                UploadError::Unauthorized(_) => StatusCode::FORBIDDEN,
                UploadError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                UploadError::SessionExpired(_) => StatusCode::GONE,
                UploadError::IncompleteUpload { .. } => StatusCode::CONFLICT,
                UploadError::ChunkTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                UploadError::TooManySessions { .. } => StatusCode::TOO_MANY_REQUESTS,
                UploadError::Storage(_) | UploadError::Internal(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match self {
            AppError::Unauthorized(msg) => ApiErrorBody {
                error: msg,
                code: ErrorCode::Unauthorized,
                missing_chunks: Vec::new(),
            },
            AppError::BadRequest(msg) => ApiErrorBody {
                error: msg,
                code: ErrorCode::BadRequest,
                missing_chunks: Vec::new(),
            },
            AppError::Upload(e) => {
                let code = e.code();
                match e {
                    UploadError::Storage(_) | UploadError::Internal(_) => {
                        tracing::error!("Upload operation failed: {:?}", e);
                        ApiErrorBody {
                            error: "Internal Server Error".to_string(),
                            code,
                            missing_chunks: Vec::new(),
                        }
                    }
                    UploadError::IncompleteUpload { missing } => ApiErrorBody {
                        error: format!("Incomplete upload, {} chunks missing", missing.len()),
                        code,
                        missing_chunks: missing,
                    },
                    other => ApiErrorBody {
                        error: other.to_string(),
                        code,
                        missing_chunks: Vec::new(),
                    },
                }
            }
        };

        (status, Json(body)).into_response()
    }
}
