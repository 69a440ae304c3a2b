use crate::models::ErrorCode;
use crate::services::error::UploadError;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a single failed protocol call, as seen by the orchestrator.
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    /// The call was aborted locally by `pause`, `cancel` or `clear_queue`.
    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    /// The receiver answered with a typed error.
    #[error("{message}")]
    Rejected {
        status: Option<u16>,
        code: ErrorCode,
        message: String,
        missing_chunks: Vec<u32>,
    },

    #[error("Failed to read source: {0}")]
    Source(String),
}

impl TransferError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            TransferError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Missing indices reported by an `IncompleteUpload` rejection.
    pub fn missing_chunks(&self) -> &[u32] {
        match self {
            TransferError::Rejected { missing_chunks, .. } => missing_chunks,
            _ => &[],
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Timeout(_) | TransferError::Network(_))
    }
}

impl From<UploadError> for TransferError {
    fn from(err: UploadError) -> Self {
        let code = err.code();
        let missing_chunks = match &err {
            UploadError::IncompleteUpload { missing } => missing.clone(),
            _ => Vec::new(),
        };
        TransferError::Rejected {
            status: None,
            code,
            message: err.to_string(),
            missing_chunks,
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Source(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_upload_keeps_missing_indices() {
        let err = TransferError::from(UploadError::IncompleteUpload {
            missing: vec![1, 3],
        });
        assert_eq!(err.code(), Some(ErrorCode::IncompleteUpload));
        assert_eq!(err.missing_chunks(), &[1, 3]);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        assert!(TransferError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(TransferError::Network("reset".into()).is_transient());
        assert!(!TransferError::Cancelled.is_transient());
        assert_eq!(TransferError::Cancelled.code(), None);
    }
}
