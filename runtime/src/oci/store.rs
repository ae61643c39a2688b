//! Disk-based content store for driver images.
//!
//! Pulled images are kept as OCI layouts under `sha256/<digest>/` with an
//! in-memory index mirrored to `index.json`, so a driver image is downloaded
//! at most once per host even across proxy restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use csi_proxy_core::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Metadata for a stored image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredImage {
    /// Normalized reference the image was pulled under
    pub reference: String,
    /// Manifest digest
    pub digest: String,
    /// When the image was pulled
    pub pulled_at: DateTime<Utc>,
    /// OCI layout directory
    pub path: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    images: Vec<StoredImage>,
}

/// Content store keyed by reference, deduplicated by digest.
pub struct ImageStore {
    store_dir: PathBuf,
    index: RwLock<HashMap<String, StoredImage>>,
}

impl ImageStore {
    /// Open (or create) a store rooted at `store_dir`.
    pub fn new(store_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(store_dir).map_err(|e| {
            ProxyError::OciImageError(format!(
                "Failed to create image store directory {}: {}",
                store_dir.display(),
                e
            ))
        })?;

        let index = load_index(&store_dir.join("index.json"))?;
        Ok(Self {
            store_dir: store_dir.to_path_buf(),
            index: RwLock::new(index),
        })
    }

    /// Look up an image by reference.
    pub async fn get(&self, reference: &str) -> Option<StoredImage> {
        self.index.read().await.get(reference).cloned()
    }

    /// Move a pulled layout from `source_dir` into the store.
    ///
    /// If the digest is already present the source is discarded and the
    /// existing layout is reused.
    pub async fn put(&self, reference: &str, digest: &str, source_dir: &Path) -> Result<StoredImage> {
        let digest_hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        let target_dir = self.store_dir.join("sha256").join(digest_hex);

        if target_dir.exists() {
            let _ = std::fs::remove_dir_all(source_dir);
        } else {
            if let Some(parent) = target_dir.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(source_dir, &target_dir).map_err(|e| {
                ProxyError::OciImageError(format!(
                    "Failed to move image into store {}: {}",
                    target_dir.display(),
                    e
                ))
            })?;
        }

        let stored = StoredImage {
            reference: reference.to_string(),
            digest: digest.to_string(),
            pulled_at: Utc::now(),
            path: target_dir,
        };

        let mut index = self.index.write().await;
        index.insert(reference.to_string(), stored.clone());
        self.save_index(&index).await?;
        Ok(stored)
    }

    /// Scratch directory for an in-progress pull.
    pub fn tmp_dir(&self, name: &str) -> PathBuf {
        self.store_dir.join("tmp").join(name)
    }

    async fn save_index(&self, index: &HashMap<String, StoredImage>) -> Result<()> {
        let store_index = StoreIndex {
            images: index.values().cloned().collect(),
        };
        let data = serde_json::to_string_pretty(&store_index)?;
        let index_path = self.store_dir.join("index.json");
        let tmp_path = index_path.with_extension("json.tmp");

        tokio::fs::write(&tmp_path, data).await.map_err(|e| {
            ProxyError::OciImageError(format!(
                "Failed to write image store index {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        tokio::fs::rename(&tmp_path, &index_path).await?;
        Ok(())
    }
}

fn load_index(index_path: &Path) -> Result<HashMap<String, StoredImage>> {
    if !index_path.exists() {
        return Ok(HashMap::new());
    }

    let data = std::fs::read_to_string(index_path).map_err(|e| {
        ProxyError::OciImageError(format!(
            "Failed to read image store index {}: {}",
            index_path.display(),
            e
        ))
    })?;
    let store_index: StoreIndex = serde_json::from_str(&data).map_err(|e| {
        ProxyError::OciImageError(format!("Failed to parse image store index: {}", e))
    })?;

    // Entries whose layout was deleted behind our back are dropped.
    Ok(store_index
        .images
        .into_iter()
        .filter(|img| img.path.exists())
        .map(|img| (img.reference.clone(), img))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_layout(dir: &Path) {
        std::fs::create_dir_all(dir.join("blobs/sha256")).unwrap();
        std::fs::write(dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
        std::fs::write(dir.join("index.json"), r#"{"manifests":[]}"#).unwrap();
    }

    #[tokio::test]
    async fn test_put_moves_layout() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(&tmp.path().join("images")).unwrap();
        let source = store.tmp_dir("pull-1");
        fake_layout(&source);

        let stored = store
            .put("docker.io/org/driver:1.0", "sha256:abc", &source)
            .await
            .unwrap();

        assert!(stored.path.join("oci-layout").exists());
        assert!(!source.exists());
        assert_eq!(
            store.get("docker.io/org/driver:1.0").await.unwrap().digest,
            "sha256:abc"
        );
    }

    #[tokio::test]
    async fn test_put_same_digest_twice_reuses_layout() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(&tmp.path().join("images")).unwrap();

        let first = store.tmp_dir("a");
        fake_layout(&first);
        let a = store.put("ref:a", "sha256:same", &first).await.unwrap();

        let second = store.tmp_dir("b");
        fake_layout(&second);
        let b = store.put("ref:b", "sha256:same", &second).await.unwrap();

        assert_eq!(a.path, b.path);
        assert!(!second.exists());
        assert_eq!(store.get("ref:a").await.unwrap().path, b.path);
        assert_eq!(store.get("ref:b").await.unwrap().digest, "sha256:same");
    }

    #[tokio::test]
    async fn test_get_missing() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path()).unwrap();
        assert!(store.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("images");
        {
            let store = ImageStore::new(&dir).unwrap();
            let source = store.tmp_dir("x");
            fake_layout(&source);
            store.put("ref:x", "sha256:persist", &source).await.unwrap();
        }

        let store = ImageStore::new(&dir).unwrap();
        assert_eq!(store.get("ref:x").await.unwrap().digest, "sha256:persist");
        assert!(!dir.join("index.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_reopen_drops_missing_layouts() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("images");
        let path = {
            let store = ImageStore::new(&dir).unwrap();
            let source = store.tmp_dir("x");
            fake_layout(&source);
            store.put("ref:x", "sha256:gone", &source).await.unwrap().path
        };
        std::fs::remove_dir_all(path).unwrap();

        let store = ImageStore::new(&dir).unwrap();
        assert!(store.get("ref:x").await.is_none());
    }
}
