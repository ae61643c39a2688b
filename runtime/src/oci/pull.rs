//! Cache-first driver image pull.
//!
//! The local store is checked first; on a miss the image is pulled into a
//! scratch directory and moved into the store under its manifest digest.

use std::sync::Arc;

use csi_proxy_core::error::{ProxyError, Result};

use super::image::OciImage;
use super::reference::ImageReference;
use super::registry::{RegistryAuth, RegistryPuller};
use super::store::ImageStore;

/// Image puller backed by an [`ImageStore`].
pub struct ImagePuller {
    store: Arc<ImageStore>,
    puller: RegistryPuller,
}

impl ImagePuller {
    pub fn new(store: Arc<ImageStore>, auth: RegistryAuth) -> Self {
        Self {
            store,
            puller: RegistryPuller::with_auth(auth),
        }
    }

    /// Pull an image, using the local store if it is already there.
    pub async fn pull(&self, reference: &str) -> Result<OciImage> {
        let parsed = ImageReference::parse(reference)?;
        let full_ref = parsed.full_reference();

        if let Some(stored) = self.store.get(&full_ref).await {
            tracing::info!(
                reference = %full_ref,
                digest = %stored.digest,
                "Using cached driver image"
            );
            return OciImage::from_path(&stored.path);
        }

        let tmp_dir = self.store.tmp_dir(&scratch_name(&full_ref));
        if tmp_dir.exists() {
            std::fs::remove_dir_all(&tmp_dir).map_err(|e| {
                ProxyError::OciImageError(format!(
                    "Failed to clean temp directory {}: {}",
                    tmp_dir.display(),
                    e
                ))
            })?;
        }

        let digest = match self.puller.pull(&parsed, &tmp_dir).await {
            Ok(digest) => digest,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&tmp_dir);
                return Err(e);
            }
        };

        let stored = self.store.put(&full_ref, &digest, &tmp_dir).await?;
        OciImage::from_path(&stored.path)
    }
}

/// Filesystem-safe scratch directory name for a reference.
fn scratch_name(full_ref: &str) -> String {
    full_ref
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}
