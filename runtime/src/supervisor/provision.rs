//! Driver image provisioning: pull into the store, unpack into a rootfs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use csi_proxy_core::config::DriverDefinition;
use csi_proxy_core::error::{ProxyError, Result};

use crate::oci::{DriverRootfsBuilder, ImagePuller, ImageStore, RegistryAuth};

/// Materializes a driver's rootfs.
#[async_trait]
pub trait ImageProvisioner: Send + Sync {
    /// Make `rootfs` hold the driver's image and return the host path of its binary.
    async fn provision(&self, driver: &DriverDefinition, rootfs: &Path) -> Result<PathBuf>;
}

/// Provisioner backed by an OCI registry and the local image store.
pub struct OciProvisioner {
    puller: ImagePuller,
}

impl OciProvisioner {
    pub fn new(images_dir: &Path, auth: RegistryAuth) -> Result<Self> {
        let store = Arc::new(ImageStore::new(images_dir)?);
        Ok(Self {
            puller: ImagePuller::new(store, auth),
        })
    }
}

#[async_trait]
impl ImageProvisioner for OciProvisioner {
    async fn provision(&self, driver: &DriverDefinition, rootfs: &Path) -> Result<PathBuf> {
        let image = self.puller.pull(&driver.image).await?;

        let rootfs = rootfs.to_path_buf();
        let bin_path = driver.bin_path.clone();
        tokio::task::spawn_blocking(move || {
            let builder = DriverRootfsBuilder::new(rootfs);
            builder.build(&image)?;
            builder.resolve_binary(&bin_path)
        })
        .await
        .map_err(|e| ProxyError::Other(format!("rootfs unpack task failed: {}", e)))?
    }
}
