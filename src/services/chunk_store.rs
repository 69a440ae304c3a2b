use std::collections::BTreeSet;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const CHUNK_EXT: &str = "part";

/// Temporary per-session chunk files: `<root>/<session_id>/<index>.part`.
///
/// A chunk is written to a uniquely named staging file and renamed over its final
/// name, so concurrent deliveries of the same index never interleave bytes and a
/// re-delivery replaces rather than duplicates.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub async fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    pub fn chunk_path(&self, session_id: &str, index: u32) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("{:08}.{}", index, CHUNK_EXT))
    }

    pub async fn write_chunk(&self, session_id: &str, index: u32, data: &[u8]) -> io::Result<()> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).await?;

        let tmp_path = dir.join(format!(".{:08}.{}.tmp", index, Uuid::new_v4()));
        let result = async {
            let mut tmp_file = File::create(&tmp_path).await?;
            tmp_file.write_all(data).await?;
            tmp_file.sync_all().await?;
            fs::rename(&tmp_path, self.chunk_path(session_id, index)).await
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path).await;
        }
        result
    }

    pub async fn remove_chunk(&self, session_id: &str, index: u32) -> io::Result<()> {
        ignore_not_found(fs::remove_file(self.chunk_path(session_id, index)).await)
    }

    /// Indices that have a finished chunk file on disk.
    pub async fn stored_indices(&self, session_id: &str) -> io::Result<BTreeSet<u32>> {
        let mut indices = BTreeSet::new();
        let mut entries = match fs::read_dir(self.session_dir(session_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(indices),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHUNK_EXT) {
                continue;
            }
            if let Some(index) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok())
            {
                indices.insert(index);
            }
        }
        Ok(indices)
    }

    pub async fn remove_session(&self, session_id: &str) -> io::Result<()> {
        ignore_not_found(fs::remove_dir_all(self.session_dir(session_id)).await)
    }

    /// Removes the session directory only if nothing is left in it.
    pub async fn remove_session_if_empty(&self, session_id: &str) {
        let _ = fs::remove_dir(self.session_dir(session_id)).await;
    }

    /// Every session directory present on disk with its last modification time.
    pub async fn session_dirs(&self) -> io::Result<Vec<(String, SystemTime)>> {
        let mut dirs = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                dirs.push((name.to_string(), meta.modified()?));
            }
        }
        Ok(dirs)
    }
}

fn ignore_not_found(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
