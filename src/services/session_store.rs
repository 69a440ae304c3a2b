use crate::models::Destination;
use crate::utils::validation::is_session_id;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

/// Receiver-side record of one file's chunk stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub session_id: String,
    pub owner: String,
    pub destination: Destination,
    pub original_file_name: String,
    pub total_chunks: u32,
    pub received_chunks: BTreeSet<u32>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(
        owner: String,
        destination: Destination,
        original_file_name: String,
        total_chunks: u32,
        ttl: chrono::Duration,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            session_id: new_session_id(),
            owner,
            destination,
            original_file_name,
            total_chunks,
            received_chunks: BTreeSet::new(),
            created_at,
            expires_at: created_at + ttl,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Indices in `0..total_chunks` that have not been received, ascending.
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.received_chunks.contains(i))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.received_chunks.len() == self.total_chunks as usize
            && self.received_chunks.iter().all(|i| *i < self.total_chunks)
    }
}

/// 256 random bits, hex encoded.
pub fn new_session_id() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// Key-value persistence for upload sessions, keyed by session id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<UploadSession>>;
    /// Inserts or replaces the record for `session.session_id`.
    async fn put(&self, session: &UploadSession) -> Result<()>;
    async fn remove(&self, session_id: &str) -> Result<Option<UploadSession>>;
    async fn list(&self) -> Result<Vec<UploadSession>>;
}

/// Sessions held in process memory; lost on restart.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, UploadSession>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<UploadSession>> {
        Ok(self.sessions.get(session_id).map(|s| s.value().clone()))
    }

    async fn put(&self, session: &UploadSession) -> Result<()> {
        self.sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<Option<UploadSession>> {
        Ok(self.sessions.remove(session_id).map(|(_, s)| s))
    }

    async fn list(&self) -> Result<Vec<UploadSession>> {
        Ok(self.sessions.iter().map(|s| s.value().clone()).collect())
    }
}

/// One JSON document per session under a directory. Survives process restarts.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn record_path(&self, session_id: &str) -> Option<PathBuf> {
        is_session_id(session_id).then(|| self.dir.join(format!("{}.json", session_id)))
    }

    async fn read_record(path: &Path) -> Result<Option<UploadSession>> {
        match fs::read(path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<UploadSession>> {
        match self.record_path(session_id) {
            Some(path) => Self::read_record(&path).await,
            None => Ok(None),
        }
    }

    async fn put(&self, session: &UploadSession) -> Result<()> {
        let path = self
            .record_path(&session.session_id)
            .ok_or_else(|| anyhow::anyhow!("malformed session id"))?;

        // Write-then-rename so a crash never leaves a truncated record
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", session.session_id, Uuid::new_v4()));
        fs::write(&tmp, serde_json::to_vec(session)?).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<Option<UploadSession>> {
        let Some(path) = self.record_path(session_id) else {
            return Ok(None);
        };
        let existing = Self::read_record(&path).await?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(existing),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<UploadSession>> {
        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable session record {:?}: {}", path, e),
            }
        }
        Ok(sessions)
    }
}
