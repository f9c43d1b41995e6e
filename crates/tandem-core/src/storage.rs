use std::path::PathBuf;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

/// On-disk blob store for captures and fused artifacts.
///
/// Blobs are addressed by relative path under one root. Captures are named
/// by their content digest, so byte-identical uploads within a couple map to
/// the same object and rewrites are idempotent.
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub async fn new(root: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&root).await?;
        info!("Blob storage directory: {}", root.display());
        Ok(Self { root })
    }

    pub fn abs_path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn capture_path(couple_id: Uuid, digest: &str, ext: &str) -> String {
        format!("couples/{couple_id}/captures/{digest}.{ext}")
    }

    pub fn fused_path(couple_id: Uuid, moment_id: Uuid, ext: &str) -> String {
        format!("couples/{couple_id}/moments/{moment_id}/fused.{ext}")
    }

    pub fn thumb_path(couple_id: Uuid, moment_id: Uuid, ext: &str) -> String {
        format!("couples/{couple_id}/moments/{moment_id}/thumb.{ext}")
    }

    pub async fn save(&self, rel: &str, bytes: &[u8]) -> std::io::Result<()> {
        let path = self.abs_path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(&path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn read(&self, rel: &str) -> std::io::Result<Vec<u8>> {
        fs::read(self.abs_path(rel)).await
    }

    pub async fn delete(&self, rel: &str) -> std::io::Result<()> {
        match fs::remove_file(self.abs_path(rel)).await {
            Ok(()) => {
                info!("Deleted blob {}", rel);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Blob {} already gone", rel);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self, rel: &str) -> bool {
        fs::try_exists(self.abs_path(rel)).await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn save_read_delete_round_trip() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path().join("blobs")).await.unwrap();

        let rel = BlobStore::capture_path(Uuid::new_v4(), "abc123", "jpg");
        store.save(&rel, b"payload").await.unwrap();
        assert!(store.exists(&rel).await);
        assert_eq!(store.read(&rel).await.unwrap(), b"payload");

        store.delete(&rel).await.unwrap();
        assert!(!store.exists(&rel).await);
        // Deleting again is tolerated.
        store.delete(&rel).await.unwrap();
    }
}
