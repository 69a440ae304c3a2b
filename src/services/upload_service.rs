use crate::config::UploadConfig;
use crate::models::{
    ChunkAck, CompleteUploadRequest, CompleteUploadResponse, InitUploadRequest,
    InitUploadResponse, SessionStatusResponse, chunk_checksum,
};
use crate::services::catalog::DestinationCatalog;
use crate::services::chunk_store::ChunkStore;
use crate::services::error::{UploadError, UploadResult};
use crate::services::session_store::{SessionStore, UploadSession};
use crate::services::storage::StorageService;
use crate::utils::keyed_mutex::KeyedMutex;
use crate::utils::validation::{sanitize_filename, validate_path_segment};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use validator::Validate;

/// Outcome of one reaper pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    pub expired_sessions: usize,
    pub orphaned_chunk_dirs: usize,
    pub staging_files: usize,
}

/// Receives chunks for upload sessions and assembles completed sessions into
/// durable artifacts.
///
/// Every operation re-reads the session record before acting on it. Mutations of a
/// session's record, and deletion of its chunks, happen under that session's lock.
pub struct UploadService {
    sessions: Arc<dyn SessionStore>,
    chunks: ChunkStore,
    storage: Arc<dyn StorageService>,
    catalog: Arc<dyn DestinationCatalog>,
    locks: KeyedMutex,
    config: UploadConfig,
}

impl UploadService {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        chunks: ChunkStore,
        storage: Arc<dyn StorageService>,
        catalog: Arc<dyn DestinationCatalog>,
        config: UploadConfig,
    ) -> Self {
        Self {
            sessions,
            chunks,
            storage,
            catalog,
            locks: KeyedMutex::new(),
            config,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageService> {
        &self.storage
    }

    pub async fn init_session(
        &self,
        owner: &str,
        req: InitUploadRequest,
    ) -> UploadResult<InitUploadResponse> {
        let dest = &req.destination;
        for (field, value) in ["course_id", "section_id", "lecture_id"]
            .into_iter()
            .zip(dest.segments())
        {
            validate_path_segment(field, value)
                .map_err(|e| UploadError::InvalidDestination(e.message))?;
        }

        req.validate()
            .map_err(|e| UploadError::InvalidRequest(e.to_string()))?;

        if req.total_chunks > self.config.max_total_chunks {
            return Err(UploadError::InvalidRequest(format!(
                "total_chunks {} exceeds limit of {}",
                req.total_chunks, self.config.max_total_chunks
            )));
        }

        let file_name = sanitize_filename(&req.file_name)
            .map_err(|e| UploadError::InvalidRequest(e.message))?;

        self.catalog.authorize(owner, dest).await?;

        // Serialize inits per owner so the session cap cannot be raced past
        let _owner_guard = self.locks.lock(&format!("owner:{}", owner)).await;

        let now = Utc::now();
        let pending = self
            .sessions
            .list()
            .await?
            .iter()
            .filter(|s| s.owner == owner && !s.is_expired_at(now))
            .count();
        if pending >= self.config.max_sessions_per_user {
            return Err(UploadError::TooManySessions {
                limit: self.config.max_sessions_per_user,
            });
        }

        let session = UploadSession::new(
            owner.to_string(),
            req.destination.clone(),
            file_name,
            req.total_chunks,
            self.config.session_ttl(),
        );

        tokio::fs::create_dir_all(self.chunks.session_dir(&session.session_id)).await?;
        self.sessions.put(&session).await?;

        tracing::info!(
            "Upload session {} created by {} for {} ({} chunks, file {})",
            session.session_id,
            owner,
            session.destination,
            session.total_chunks,
            session.original_file_name
        );

        Ok(InitUploadResponse {
            session_id: session.session_id,
            total_chunks: session.total_chunks,
            expires_at: session.expires_at,
        })
    }

    pub async fn receive_chunk(
        &self,
        owner: &str,
        session_id: &str,
        chunk_index: u32,
        data: Bytes,
        checksum: Option<&str>,
    ) -> UploadResult<ChunkAck> {
        if data.len() > self.config.max_chunk_size {
            return Err(UploadError::ChunkTooLarge {
                size: data.len(),
                limit: self.config.max_chunk_size,
            });
        }

        let session = self.load_live(owner, session_id, Utc::now()).await?;

        if chunk_index >= session.total_chunks {
            return Err(UploadError::InvalidChunkIndex {
                index: chunk_index,
                total_chunks: session.total_chunks,
            });
        }

        if let Some(expected) = checksum {
            if !chunk_checksum(&data).eq_ignore_ascii_case(expected.trim()) {
                return Err(UploadError::ChecksumMismatch { index: chunk_index });
            }
        }

        // Chunk files are independent per index, so the write itself needs no lock
        self.chunks
            .write_chunk(session_id, chunk_index, &data)
            .await?;

        let _guard = self.locks.lock(session_id).await;

        let mut session = match self.load_live(owner, session_id, Utc::now()).await {
            Ok(session) => session,
            Err(e) => {
                // Session completed, aborted or reaped while the bytes were in flight
                tracing::warn!(
                    "Discarding chunk {} of vanished session {}: {}",
                    chunk_index,
                    session_id,
                    e
                );
                if matches!(e, UploadError::SessionNotFound(_)) {
                    let _ = self.chunks.remove_chunk(session_id, chunk_index).await;
                    self.chunks.remove_session_if_empty(session_id).await;
                }
                return Err(e);
            }
        };

        if session.received_chunks.insert(chunk_index) {
            self.sessions.put(&session).await?;
        } else {
            tracing::debug!(
                "Chunk {} of session {} re-delivered",
                chunk_index,
                session_id
            );
        }

        Ok(ChunkAck {
            session_id: session.session_id,
            chunk_index,
            received_chunks: session.received_chunks.len() as u32,
        })
    }

    pub async fn complete_session(
        &self,
        owner: &str,
        session_id: &str,
        req: CompleteUploadRequest,
    ) -> UploadResult<CompleteUploadResponse> {
        let _guard = self.locks.lock(session_id).await;

        let mut session = self.load_live(owner, session_id, Utc::now()).await?;

        if req.total_chunks != session.total_chunks {
            return Err(UploadError::InvalidRequest(format!(
                "total_chunks {} does not match session ({})",
                req.total_chunks, session.total_chunks
            )));
        }

        if sanitize_filename(&req.file_name).ok().as_deref()
            != Some(session.original_file_name.as_str())
        {
            tracing::warn!(
                "Completion for session {} names '{}', keeping '{}' from init",
                session_id,
                req.file_name,
                session.original_file_name
            );
        }

        let on_disk = self.chunks.stored_indices(session_id).await?;
        let lost: Vec<u32> = session
            .received_chunks
            .iter()
            .copied()
            .filter(|i| !on_disk.contains(i))
            .collect();
        if !lost.is_empty() {
            tracing::warn!(
                "Session {} records chunks {:?} that are not on disk",
                session_id,
                lost
            );
            for i in &lost {
                session.received_chunks.remove(i);
            }
            self.sessions.put(&session).await?;
        }

        if !session.is_complete() {
            let missing = session.missing_chunks();
            tracing::info!(
                "Session {} is incomplete, missing {:?}",
                session_id,
                missing
            );
            return Err(UploadError::IncompleteUpload { missing });
        }

        let parts: Vec<PathBuf> = (0..session.total_chunks)
            .map(|i| self.chunks.chunk_path(session_id, i))
            .collect();
        let key = session.destination.storage_prefix().join(format!(
            "{}-{}",
            session.session_id, session.original_file_name
        ));

        let asset = self.storage.assemble(&key, &parts).await.map_err(|e| {
            tracing::error!("Assembly of session {} failed: {:#}", session_id, e);
            UploadError::Internal(e)
        })?;

        // The artifact is published; drop the record first so a crash here leaves
        // only orphaned chunks for the reaper, never a session pointing at nothing.
        self.sessions.remove(session_id).await?;
        if let Err(e) = self.chunks.remove_session(session_id).await {
            tracing::warn!(
                "Failed to delete chunks of completed session {}: {}",
                session_id,
                e
            );
        }

        tracing::info!(
            "Upload session {} completed: {} ({} bytes)",
            session_id,
            asset.locator,
            asset.size
        );

        Ok(CompleteUploadResponse {
            asset_locator: asset.locator,
            file_name: session.original_file_name,
            size: asset.size,
            checksum: asset.checksum,
        })
    }

    pub async fn session_status(
        &self,
        owner: &str,
        session_id: &str,
    ) -> UploadResult<SessionStatusResponse> {
        let session = self.load_live(owner, session_id, Utc::now()).await?;
        Ok(status_of(session))
    }

    pub async fn list_pending_sessions(&self, owner: &str) -> UploadResult<Vec<SessionStatusResponse>> {
        let now = Utc::now();
        let mut sessions: Vec<UploadSession> = self
            .sessions
            .list()
            .await?
            .into_iter()
            .filter(|s| s.owner == owner && !s.is_expired_at(now))
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions.into_iter().map(status_of).collect())
    }

    /// Discards a session and its chunks. Expired sessions may be aborted too.
    pub async fn abort_session(&self, owner: &str, session_id: &str) -> UploadResult<()> {
        let _guard = self.locks.lock(session_id).await;

        match self.sessions.get(session_id).await? {
            Some(session) if session.owner == owner => {}
            _ => return Err(UploadError::SessionNotFound(session_id.to_string())),
        }

        self.sessions.remove(session_id).await?;
        self.chunks.remove_session(session_id).await?;
        tracing::info!("Upload session {} aborted by {}", session_id, owner);
        Ok(())
    }

    /// Deletes sessions past their expiry, chunk directories with no session that
    /// are older than the session TTL, and stale assembly staging files.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> UploadResult<ReapReport> {
        let mut report = ReapReport::default();

        for candidate in self.sessions.list().await? {
            if !candidate.is_expired_at(now) {
                continue;
            }
            let id = candidate.session_id;
            let _guard = self.locks.lock(&id).await;

            // Re-check under the lock: it may have completed meanwhile
            let Some(session) = self.sessions.get(&id).await? else {
                continue;
            };
            if !session.is_expired_at(now) {
                continue;
            }

            self.sessions.remove(&id).await?;
            self.chunks.remove_session(&id).await?;
            report.expired_sessions += 1;
            tracing::info!(
                "Reaped expired upload session {} ({}/{} chunks received)",
                id,
                session.received_chunks.len(),
                session.total_chunks
            );
        }

        let ttl = self.config.session_ttl();
        let orphan_cutoff = SystemTime::from(now - ttl);
        for (id, modified) in self.chunks.session_dirs().await? {
            if modified > orphan_cutoff {
                continue;
            }
            let _guard = self.locks.lock(&id).await;
            if self.sessions.get(&id).await?.is_none() {
                self.chunks.remove_session(&id).await?;
                report.orphaned_chunk_dirs += 1;
                tracing::info!("Removed orphaned chunk directory {}", id);
            }
        }

        report.staging_files = self
            .storage
            .sweep_staging(ttl.to_std().unwrap_or_default())
            .await?;

        self.locks.cleanup();
        Ok(report)
    }

    /// Loads a session the caller owns that has not expired.
    async fn load_live(
        &self,
        owner: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> UploadResult<UploadSession> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .filter(|s| s.owner == owner)
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;

        if session.is_expired_at(now) {
            return Err(UploadError::SessionExpired(session_id.to_string()));
        }
        Ok(session)
    }
}

fn status_of(session: UploadSession) -> SessionStatusResponse {
    let missing_chunks = session.missing_chunks();
    SessionStatusResponse {
        session_id: session.session_id,
        file_name: session.original_file_name,
        destination: session.destination,
        total_chunks: session.total_chunks,
        received_chunks: session.received_chunks.into_iter().collect(),
        missing_chunks,
        created_at: session.created_at,
        expires_at: session.expires_at,
    }
}
