use crate::config::{SessionStoreKind, UploadConfig};
use crate::services::catalog::{DestinationCatalog, OpenCatalog, StaticCatalog};
use crate::services::chunk_store::ChunkStore;
use crate::services::session_store::{FileSessionStore, MemorySessionStore, SessionStore};
use crate::services::storage::{LocalStorageService, StorageService};
use crate::services::upload_service::UploadService;
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

pub async fn setup_storage(config: &UploadConfig) -> Result<Arc<dyn StorageService>> {
    info!(
        "💾 Artifact storage: {:?} (locators under {})",
        config.storage_dir, config.public_base_url
    );
    let storage = LocalStorageService::new(&config.storage_dir, &config.public_base_url).await?;
    Ok(Arc::new(storage))
}

pub async fn setup_session_store(config: &UploadConfig) -> Result<Arc<dyn SessionStore>> {
    match config.session_store {
        SessionStoreKind::Memory => {
            warn!("⚠️  In-memory session store: pending uploads will not survive a restart");
            Ok(Arc::new(MemorySessionStore::new()))
        }
        SessionStoreKind::File => {
            info!("🗂️  Session store: {:?}", config.session_store_dir);
            Ok(Arc::new(FileSessionStore::open(&config.session_store_dir).await?))
        }
    }
}

pub async fn setup_catalog(config: &UploadConfig) -> Result<Arc<dyn DestinationCatalog>> {
    match &config.catalog_path {
        Some(path) => {
            let catalog = StaticCatalog::from_file(path).await?;
            info!("📚 Loaded {} content slots from {:?}", catalog.len(), path);
            Ok(Arc::new(catalog))
        }
        None => {
            warn!("⚠️  No CATALOG_PATH set: any well-formed destination is accepted");
            Ok(Arc::new(OpenCatalog))
        }
    }
}

/// Wires the receiver from configuration.
pub async fn setup_upload_service(config: &UploadConfig) -> Result<Arc<UploadService>> {
    let chunks = ChunkStore::open(&config.temp_dir).await?;
    info!("🧩 Chunk staging: {:?}", chunks.root());

    Ok(Arc::new(UploadService::new(
        setup_session_store(config).await?,
        chunks,
        setup_storage(config).await?,
        setup_catalog(config).await?,
        config.clone(),
    )))
}
