//! OCI image layout reader.
//!
//! Resolves `index.json` → manifest → ordered layer blobs for a layout that
//! was written by the registry puller.

use csi_proxy_core::error::{ProxyError, Result};
use oci_spec::image::{ImageIndex, ImageManifest};
use std::path::{Path, PathBuf};

/// An OCI image layout on disk.
#[derive(Debug)]
pub struct OciImage {
    root_dir: PathBuf,
    manifest_digest: String,
    layer_paths: Vec<PathBuf>,
}

impl OciImage {
    /// Load an image layout from `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let root_dir = path.as_ref().to_path_buf();
        if !root_dir.join("oci-layout").exists() {
            return Err(ProxyError::OciImageError(format!(
                "Not a valid OCI layout: missing oci-layout file in {}",
                root_dir.display()
            )));
        }

        let index: ImageIndex = read_json(&root_dir.join("index.json"), "index.json")?;
        let manifest_digest = index
            .manifests()
            .first()
            .ok_or_else(|| ProxyError::OciImageError("No manifests in index.json".to_string()))?
            .digest()
            .to_string();

        let manifest: ImageManifest =
            read_json(&blob_path(&root_dir, &manifest_digest), "manifest")?;
        let layer_paths = manifest
            .layers()
            .iter()
            .map(|layer| blob_path(&root_dir, &layer.digest().to_string()))
            .collect();

        Ok(Self {
            root_dir,
            manifest_digest,
            layer_paths,
        })
    }

    /// Layer blobs, bottom to top.
    pub fn layer_paths(&self) -> &[PathBuf] {
        &self.layer_paths
    }

    /// Manifest digest from the layout index.
    pub fn manifest_digest(&self) -> &str {
        &self.manifest_digest
    }

    /// Layout root directory.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ProxyError::OciImageError(format!("Failed to read {} at {}: {}", what, path.display(), e))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| ProxyError::OciImageError(format!("Failed to parse {}: {}", what, e)))
}

/// `blobs/<algorithm>/<hex>` for a digest like `sha256:abc`.
fn blob_path(root_dir: &Path, digest: &str) -> PathBuf {
    let (algorithm, hash) = digest.split_once(':').unwrap_or(("sha256", digest));
    root_dir.join("blobs").join(algorithm).join(hash)
}
