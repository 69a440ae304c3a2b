//! Client side of the upload protocol: a queue that drives one chunked transfer
//! at a time against an [`UploadTransport`].

pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod source;
pub mod transport;

pub use error::TransferError;
pub use orchestrator::{UploadEvent, UploadItem, UploadOrchestrator, UploadState};
pub use source::{FileSource, MemorySource, UploadSource};
pub use transport::{HttpTransport, LocalTransport, UploadTransport};

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Receiver base URL, e.g. `http://127.0.0.1:3000`
    pub base_url: String,
    /// Bearer token sent with every request
    pub token: String,
    pub chunk_size: usize,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            token: String::new(),
            chunk_size: 5 * 1024 * 1024,
            request_timeout: Duration::from_secs(60),
        }
    }
}
