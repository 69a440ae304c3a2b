use crate::client::ClientConfig;
use crate::client::error::TransferError;
use crate::models::{
    ApiErrorBody, CHUNK_CHECKSUM_HEADER, ChunkAck, CompleteUploadRequest, CompleteUploadResponse,
    ErrorCode, InitUploadRequest, InitUploadResponse, chunk_checksum,
};
use crate::services::upload_service::UploadService;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    Client as HttpClient, Response, StatusCode, Url,
    header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT},
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

const CLIENT_USER_AGENT: &str = concat!("lecture-upload/", env!("CARGO_PKG_VERSION"));

/// The three-phase protocol between orchestrator and receiver.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn init(&self, req: &InitUploadRequest) -> Result<InitUploadResponse, TransferError>;

    /// Sends one chunk. Re-sending an index the receiver already holds is harmless.
    async fn send_chunk(
        &self,
        session_id: &str,
        chunk_index: u32,
        data: Bytes,
    ) -> Result<ChunkAck, TransferError>;

    async fn complete(
        &self,
        session_id: &str,
        req: &CompleteUploadRequest,
    ) -> Result<CompleteUploadResponse, TransferError>;
}

/// HTTP transport against a running receiver.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// Base endpoint of the receiver, always ending in `/`.
    endpoint: Url,
    client: HttpClient,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", config.token))?,
        );
        headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

        let client = HttpClient::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()?;

        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }

        Ok(Self {
            endpoint: Url::parse(&base)?,
            client,
            timeout: config.request_timeout,
        })
    }

    fn url(&self, path: &str) -> Result<Url, TransferError> {
        self.endpoint
            .join(path)
            .map_err(|e| TransferError::Network(format!("Invalid endpoint {}: {}", path, e)))
    }

    fn map_reqwest(&self, err: reqwest::Error) -> TransferError {
        if err.is_timeout() {
            TransferError::Timeout(self.timeout)
        } else {
            TransferError::Network(err.to_string())
        }
    }

    async fn decode<T: DeserializeOwned>(&self, res: Response) -> Result<T, TransferError> {
        if res.status().is_success() {
            return res.json().await.map_err(|e| self.map_reqwest(e));
        }

        let status = res.status();
        let text = res.text().await.map_err(|e| self.map_reqwest(e))?;

        Err(match serde_json::from_str::<ApiErrorBody>(&text) {
            Ok(body) => TransferError::Rejected {
                status: Some(status.as_u16()),
                code: body.code,
                message: body.error,
                missing_chunks: body.missing_chunks,
            },
            Err(_) => TransferError::Rejected {
                status: Some(status.as_u16()),
                code: fallback_code(status),
                message: format!("HTTP {}: {}", status, text.trim()),
                missing_chunks: Vec::new(),
            },
        })
    }
}

/// Classifies error responses that did not carry a JSON body (proxies, body limits).
fn fallback_code(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::UNAUTHORIZED => ErrorCode::Unauthorized,
        StatusCode::PAYLOAD_TOO_LARGE => ErrorCode::PayloadTooLarge,
        s if s.is_server_error() => ErrorCode::Internal,
        _ => ErrorCode::BadRequest,
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn init(&self, req: &InitUploadRequest) -> Result<InitUploadResponse, TransferError> {
        let res = self
            .client
            .post(self.url("uploads")?)
            .json(req)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;
        self.decode(res).await
    }

    async fn send_chunk(
        &self,
        session_id: &str,
        chunk_index: u32,
        data: Bytes,
    ) -> Result<ChunkAck, TransferError> {
        let url = self.url(&format!("uploads/{}/chunks/{}", session_id, chunk_index))?;
        let res = self
            .client
            .put(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CHUNK_CHECKSUM_HEADER, chunk_checksum(&data))
            .body(data)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;
        self.decode(res).await
    }

    async fn complete(
        &self,
        session_id: &str,
        req: &CompleteUploadRequest,
    ) -> Result<CompleteUploadResponse, TransferError> {
        let res = self
            .client
            .post(self.url(&format!("uploads/{}/complete", session_id))?)
            .json(req)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;
        self.decode(res).await
    }
}

/// In-process transport calling an [`UploadService`] directly on behalf of `owner`.
#[derive(Clone)]
pub struct LocalTransport {
    uploads: Arc<UploadService>,
    owner: String,
}

impl LocalTransport {
    pub fn new(uploads: Arc<UploadService>, owner: impl Into<String>) -> Self {
        Self {
            uploads,
            owner: owner.into(),
        }
    }
}

#[async_trait]
impl UploadTransport for LocalTransport {
    async fn init(&self, req: &InitUploadRequest) -> Result<InitUploadResponse, TransferError> {
        Ok(self.uploads.init_session(&self.owner, req.clone()).await?)
    }

    async fn send_chunk(
        &self,
        session_id: &str,
        chunk_index: u32,
        data: Bytes,
    ) -> Result<ChunkAck, TransferError> {
        let checksum = chunk_checksum(&data);
        Ok(self
            .uploads
            .receive_chunk(&self.owner, session_id, chunk_index, data, Some(&checksum))
            .await?)
    }

    async fn complete(
        &self,
        session_id: &str,
        req: &CompleteUploadRequest,
    ) -> Result<CompleteUploadResponse, TransferError> {
        Ok(self
            .uploads
            .complete_session(&self.owner, session_id, req.clone())
            .await?)
    }
}
