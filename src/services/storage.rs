use anyhow::Result;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;
use xxhash_rust::xxh3::Xxh3;

const STAGING_DIR_NAME: &str = ".staging";

/// An artifact written to durable storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAsset {
    pub locator: String,
    pub size: u64,
    pub checksum: String,
}

/// Write-once byte store the assembler publishes artifacts into.
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Concatenates `parts` in order into the artifact at `key`.
    ///
    /// Readers of `key` observe either the previous artifact or the complete new one.
    async fn assemble(&self, key: &Path, parts: &[PathBuf]) -> Result<StoredAsset>;

    /// Stable reference handed back to callers for `key`.
    fn locator_for(&self, key: &Path) -> String;

    async fn health_check(&self) -> bool;

    /// Deletes abandoned assembly staging files last touched before `older_than` ago.
    async fn sweep_staging(&self, older_than: Duration) -> Result<usize>;
}

pub struct LocalStorageService {
    root: PathBuf,
    public_base_url: String,
}

impl LocalStorageService {
    pub async fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(STAGING_DIR_NAME)).await?;
        Ok(Self {
            root,
            public_base_url: public_base_url.into(),
        })
    }

    pub fn path_for(&self, key: &Path) -> PathBuf {
        self.root.join(key)
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR_NAME)
    }

    async fn write_staged(&self, staged: &Path, parts: &[PathBuf]) -> Result<(u64, String)> {
        let mut out = File::create(staged).await?;
        let mut hasher = Xxh3::new();
        let mut total: u64 = 0;
        let mut buffer = vec![0u8; 1024 * 1024];

        for part in parts {
            let mut input = File::open(part).await?;
            loop {
                let n = input.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
                out.write_all(&buffer[..n]).await?;
                total += n as u64;
            }
        }

        out.flush().await?;
        out.sync_all().await?;
        Ok((total, format!("{:032x}", hasher.digest128())))
    }
}

#[async_trait]
impl StorageService for LocalStorageService {
    async fn assemble(&self, key: &Path, parts: &[PathBuf]) -> Result<StoredAsset> {
        if key
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            anyhow::bail!("storage key must be a relative path: {:?}", key);
        }

        let staged = self
            .staging_dir()
            .join(format!("{}.assembling", Uuid::new_v4()));

        let (size, checksum) = match self.write_staged(&staged, parts).await {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&staged).await;
                return Err(e);
            }
        };

        let final_path = self.path_for(key);
        let final_dir = final_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        let published = async {
            fs::create_dir_all(&final_dir).await?;
            fs::rename(&staged, &final_path).await?;
            fsync_dir(&final_dir).await
        }
        .await;

        if let Err(e) = published {
            let _ = fs::remove_file(&staged).await;
            return Err(e.into());
        }

        tracing::info!(
            "Published artifact {:?} ({} bytes, xxh3 {})",
            final_path,
            size,
            checksum
        );

        Ok(StoredAsset {
            locator: self.locator_for(key),
            size,
            checksum,
        })
    }

    fn locator_for(&self, key: &Path) -> String {
        let relative: Vec<String> = key
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        format!(
            "{}/{}",
            self.public_base_url.trim_end_matches('/'),
            relative.join("/")
        )
    }

    async fn health_check(&self) -> bool {
        fs::metadata(self.staging_dir())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn sweep_staging(&self, older_than: Duration) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;

        let mut entries = fs::read_dir(self.staging_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() && meta.modified()? <= cutoff {
                match fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(removed)
    }
}

async fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || std::fs::File::open(&dir)?.sync_all())
        .await
        .map_err(std::io::Error::other)?
}
