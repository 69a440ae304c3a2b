use crate::models::ErrorCode;
use thiserror::Error;

/// Failure of a receiver operation. Every variant leaves the session as it was.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Upload session not found: {0}")]
    SessionNotFound(String),

    #[error("Upload session expired: {0}")]
    SessionExpired(String),

    #[error("Invalid chunk index {index}, session has {total_chunks} chunks")]
    InvalidChunkIndex { index: u32, total_chunks: u32 },

    #[error("Incomplete upload, missing chunks {missing:?}")]
    IncompleteUpload { missing: Vec<u32> },

    #[error("Checksum mismatch for chunk {index}")]
    ChecksumMismatch { index: u32 },

    #[error("Too many pending upload sessions (limit {limit})")]
    TooManySessions { limit: usize },

    #[error("Chunk of {size} bytes exceeds limit of {limit} bytes")]
    ChunkTooLarge { size: usize, limit: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl UploadError {
    pub fn code(&self) -> ErrorCode {
        match self {
            UploadError::InvalidDestination(_) => ErrorCode::InvalidDestination,
            UploadError::Unauthorized(_) => ErrorCode::Unauthorized,
            UploadError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            UploadError::SessionExpired(_) => ErrorCode::SessionExpired,
            UploadError::InvalidChunkIndex { .. } => ErrorCode::InvalidChunkIndex,
            UploadError::IncompleteUpload { .. } => ErrorCode::IncompleteUpload,
            UploadError::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            UploadError::TooManySessions { .. } => ErrorCode::TooManySessions,
            UploadError::ChunkTooLarge { .. } => ErrorCode::PayloadTooLarge,
            UploadError::InvalidRequest(_) => ErrorCode::BadRequest,
            UploadError::Storage(_) | UploadError::Internal(_) => ErrorCode::Internal,
        }
    }
}

pub type UploadResult<T> = Result<T, UploadError>;
