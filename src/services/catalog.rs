use crate::models::Destination;
use crate::services::error::{UploadError, UploadResult};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Decides whether a content slot exists and whether the caller may fill it.
#[async_trait]
pub trait DestinationCatalog: Send + Sync {
    async fn authorize(&self, owner: &str, destination: &Destination) -> UploadResult<()>;
}

/// Accepts every destination. Used when no catalog is configured.
pub struct OpenCatalog;

#[async_trait]
impl DestinationCatalog for OpenCatalog {
    async fn authorize(&self, _owner: &str, _destination: &Destination) -> UploadResult<()> {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub destination: Destination,
    pub owner: String,
}

/// Fixed table of lecture slots and the instructor that owns each one.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    slots: HashMap<Destination, String>,
}

impl StaticCatalog {
    pub fn new(entries: impl IntoIterator<Item = (Destination, String)>) -> Self {
        Self {
            slots: entries.into_iter().collect(),
        }
    }

    /// Loads a JSON array of `{course_id, section_id, lecture_id, owner}` objects.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await?;
        let entries: Vec<CatalogEntry> = serde_json::from_slice(&raw)?;
        Ok(Self::new(
            entries.into_iter().map(|e| (e.destination, e.owner)),
        ))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[async_trait]
impl DestinationCatalog for StaticCatalog {
    async fn authorize(&self, owner: &str, destination: &Destination) -> UploadResult<()> {
        match self.slots.get(destination) {
            None => Err(UploadError::InvalidDestination(format!(
                "no content slot {}",
                destination
            ))),
            Some(slot_owner) if slot_owner != owner => Err(UploadError::Unauthorized(format!(
                "content slot {} belongs to another user",
                destination
            ))),
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_catalog_decisions() {
        let dest = Destination::new("c1", "s1", "l1");
        let catalog = StaticCatalog::new([(dest.clone(), "alice".to_string())]);

        assert!(catalog.authorize("alice", &dest).await.is_ok());
        assert!(matches!(
            catalog.authorize("bob", &dest).await,
            Err(UploadError::Unauthorized(_))
        ));
        assert!(matches!(
            catalog
                .authorize("alice", &Destination::new("c1", "s1", "l2"))
                .await,
            Err(UploadError::InvalidDestination(_))
        ));
    }

    #[tokio::test]
    async fn test_catalog_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        tokio::fs::write(
            &path,
            r#"[{"course_id":"c","section_id":"s","lecture_id":"l","owner":"alice"}]"#,
        )
        .await
        .unwrap();

        let catalog = StaticCatalog::from_file(&path).await.unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(
            catalog
                .authorize("alice", &Destination::new("c", "s", "l"))
                .await
                .is_ok()
        );
    }
}
