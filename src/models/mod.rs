//! Wire types shared by the receiver's HTTP API and the client orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use utoipa::ToSchema;
use validator::Validate;
use xxhash_rust::xxh3::xxh3_64;

/// Header carrying the xxh3-64 digest of a chunk body.
pub const CHUNK_CHECKSUM_HEADER: &str = "x-chunk-checksum";

/// Hex-encoded xxh3-64 digest of a chunk, as sent in [`CHUNK_CHECKSUM_HEADER`].
pub fn chunk_checksum(data: &[u8]) -> String {
    format!("{:016x}", xxh3_64(data))
}

/// The content slot a chunk stream fills (one lecture video).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema, Validate)]
pub struct Destination {
    #[validate(length(min = 1, max = 64, message = "course_id must be 1-64 characters"))]
    pub course_id: String,
    #[validate(length(min = 1, max = 64, message = "section_id must be 1-64 characters"))]
    pub section_id: String,
    #[validate(length(min = 1, max = 64, message = "lecture_id must be 1-64 characters"))]
    pub lecture_id: String,
}

impl Destination {
    pub fn new(
        course_id: impl Into<String>,
        section_id: impl Into<String>,
        lecture_id: impl Into<String>,
    ) -> Self {
        Self {
            course_id: course_id.into(),
            section_id: section_id.into(),
            lecture_id: lecture_id.into(),
        }
    }

    /// Relative directory the assembled artifact is stored under.
    pub fn storage_prefix(&self) -> PathBuf {
        PathBuf::from(&self.course_id)
            .join(&self.section_id)
            .join(&self.lecture_id)
    }

    pub fn segments(&self) -> [&str; 3] {
        [&self.course_id, &self.section_id, &self.lecture_id]
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.course_id, self.section_id, self.lecture_id
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct InitUploadRequest {
    #[validate(length(min = 1, max = 255, message = "File name must be between 1 and 255 characters"))]
    pub file_name: String,
    #[validate(range(min = 1, message = "An upload needs at least one chunk"))]
    pub total_chunks: u32,
    #[validate(nested)]
    pub destination: Destination,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InitUploadResponse {
    pub session_id: String,
    pub total_chunks: u32,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChunkAck {
    pub session_id: String,
    pub chunk_index: u32,
    /// Number of distinct chunks the session holds after this write.
    pub received_chunks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CompleteUploadRequest {
    pub total_chunks: u32,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CompleteUploadResponse {
    pub asset_locator: String,
    pub file_name: String,
    pub size: u64,
    /// xxh3-128 hex digest of the assembled artifact.
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub file_name: String,
    pub destination: Destination,
    pub total_chunks: u32,
    pub received_chunks: Vec<u32>,
    pub missing_chunks: Vec<u32>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Machine-readable failure class carried in every error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidDestination,
    Unauthorized,
    SessionNotFound,
    SessionExpired,
    InvalidChunkIndex,
    IncompleteUpload,
    ChecksumMismatch,
    TooManySessions,
    PayloadTooLarge,
    BadRequest,
    Internal,
}

impl ErrorCode {
    /// Errors after which the session can no longer be used and a fresh init is required.
    pub fn requires_new_session(self) -> bool {
        matches!(self, ErrorCode::SessionExpired | ErrorCode::SessionNotFound)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiErrorBody {
    pub error: String,
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_chunks: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_prefix_and_display() {
        let dest = Destination::new("c1", "s2", "l3");
        assert_eq!(dest.storage_prefix(), PathBuf::from("c1/s2/l3"));
        assert_eq!(dest.to_string(), "c1/s2/l3");
    }

    #[test]
    fn test_init_request_validation() {
        let ok = InitUploadRequest {
            file_name: "intro.mp4".to_string(),
            total_chunks: 3,
            destination: Destination::new("c", "s", "l"),
        };
        assert!(ok.validate().is_ok());

        let zero_chunks = InitUploadRequest {
            total_chunks: 0,
            ..ok.clone()
        };
        assert!(zero_chunks.validate().is_err());

        let empty_lecture = InitUploadRequest {
            destination: Destination::new("c", "s", ""),
            ..ok
        };
        assert!(empty_lecture.validate().is_err());
    }

    #[test]
    fn test_error_body_omits_empty_missing_list() {
        let body = ApiErrorBody {
            error: "gone".to_string(),
            code: ErrorCode::SessionExpired,
            missing_chunks: vec![],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "session_expired");
        assert!(json.get("missing_chunks").is_none());
    }
}
