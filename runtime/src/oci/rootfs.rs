//! Driver rootfs materialization.
//!
//! Unpacks a driver image into the private tree the driver binary is chrooted
//! into. A marker file records the manifest digest that was unpacked, so a
//! tree is reused across restarts and rebuilt when the image changes.

use csi_proxy_core::error::{ProxyError, Result};
use std::path::{Path, PathBuf};

use super::image::OciImage;
use super::layers::extract_layer;

/// Records the digest of the image a rootfs was built from.
const UNPACKED_MARKER: &str = ".csi-proxy-unpacked";

/// Directories the driver expects to exist inside its chroot.
const BASE_DIRS: &[&str] = &["dev", "proc", "sys", "tmp", "run/csi", "etc", "var/lib/kubelet"];

/// Builds a driver rootfs from an unpacked OCI image.
pub struct DriverRootfsBuilder {
    rootfs_path: PathBuf,
}

impl DriverRootfsBuilder {
    pub fn new(rootfs_path: impl Into<PathBuf>) -> Self {
        Self {
            rootfs_path: rootfs_path.into(),
        }
    }

    /// Whether the rootfs already holds `image`.
    pub fn is_current(&self, image: &OciImage) -> bool {
        std::fs::read_to_string(self.rootfs_path.join(UNPACKED_MARKER))
            .map(|digest| digest.trim() == image.manifest_digest())
            .unwrap_or(false)
    }

    /// Unpack `image` into the rootfs, bottom layer first.
    ///
    /// An existing tree built from the same digest is left untouched; a tree
    /// from another digest is discarded first.
    pub fn build(&self, image: &OciImage) -> Result<()> {
        if self.is_current(image) {
            tracing::debug!(
                rootfs = %self.rootfs_path.display(),
                digest = %image.manifest_digest(),
                "Driver rootfs already unpacked"
            );
            return Ok(());
        }

        if self.rootfs_path.exists() {
            std::fs::remove_dir_all(&self.rootfs_path).map_err(|e| {
                ProxyError::OciImageError(format!(
                    "Failed to remove stale rootfs {}: {}",
                    self.rootfs_path.display(),
                    e
                ))
            })?;
        }

        tracing::info!(
            rootfs = %self.rootfs_path.display(),
            digest = %image.manifest_digest(),
            layers = image.layer_paths().len(),
            "Unpacking driver image"
        );

        for layer_path in image.layer_paths() {
            extract_layer(layer_path, &self.rootfs_path)?;
        }

        for dir in BASE_DIRS {
            let full_path = self.rootfs_path.join(dir);
            std::fs::create_dir_all(&full_path).map_err(|e| {
                ProxyError::OciImageError(format!(
                    "Failed to create directory {}: {}",
                    full_path.display(),
                    e
                ))
            })?;
        }

        self.copy_host_file("/etc/resolv.conf", "etc/resolv.conf")?;
        self.copy_host_file("/etc/hosts", "etc/hosts")?;

        std::fs::write(self.rootfs_path.join(UNPACKED_MARKER), image.manifest_digest())?;
        Ok(())
    }

    /// Host path of `bin_path` inside the rootfs, which must exist.
    pub fn resolve_binary(&self, bin_path: &str) -> Result<PathBuf> {
        let path = self.rootfs_path.join(bin_path.trim_start_matches('/'));
        if !path.is_file() {
            return Err(ProxyError::OciImageError(format!(
                "Driver binary {} not found in rootfs {}",
                bin_path,
                self.rootfs_path.display()
            )));
        }
        Ok(path)
    }

    pub fn rootfs_path(&self) -> &Path {
        &self.rootfs_path
    }

    /// Copy a host file in unless the image ships its own.
    fn copy_host_file(&self, host: &str, relative: &str) -> Result<()> {
        let target = self.rootfs_path.join(relative);
        let host = Path::new(host);
        if target.exists() || !host.exists() {
            return Ok(());
        }
        std::fs::copy(host, &target).map_err(|e| {
            ProxyError::OciImageError(format!("Failed to copy {}: {}", host.display(), e))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::image::tests::write_layout;
    use crate::oci::layers::tests::layer_bytes;
    use tempfile::TempDir;

    fn driver_image(dir: &Path, content: &[u8]) -> OciImage {
        let layer = layer_bytes(&[("bin/nfsplugin", content)], true);
        write_layout(dir, &[(&"a".repeat(64), layer)]);
        OciImage::from_path(dir).unwrap()
    }

    #[test]
    fn test_build_unpacks_and_creates_base_dirs() {
        let tmp = TempDir::new().unwrap();
        let image = driver_image(&tmp.path().join("image"), b"bin");
        let builder = DriverRootfsBuilder::new(tmp.path().join("rootfs"));

        builder.build(&image).unwrap();

        assert!(builder.rootfs_path().join("run/csi").is_dir());
        assert!(builder.rootfs_path().join("dev").is_dir());
        assert!(builder.is_current(&image));
        let bin = builder.resolve_binary("/bin/nfsplugin").unwrap();
        assert_eq!(std::fs::read(bin).unwrap(), b"bin");
    }

    #[test]
    fn test_build_skips_current_rootfs() {
        let tmp = TempDir::new().unwrap();
        let image = driver_image(&tmp.path().join("image"), b"bin");
        let builder = DriverRootfsBuilder::new(tmp.path().join("rootfs"));
        builder.build(&image).unwrap();

        let extra = builder.rootfs_path().join("tmp/keep");
        std::fs::write(&extra, "x").unwrap();
        builder.build(&image).unwrap();
        assert!(extra.exists());
    }

    #[test]
    fn test_build_replaces_stale_rootfs() {
        let tmp = TempDir::new().unwrap();
        let image = driver_image(&tmp.path().join("image"), b"bin");
        let rootfs = tmp.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("old")).unwrap();
        std::fs::write(rootfs.join(UNPACKED_MARKER), "sha256:other").unwrap();

        let builder = DriverRootfsBuilder::new(&rootfs);
        assert!(!builder.is_current(&image));
        builder.build(&image).unwrap();
        assert!(!rootfs.join("old").exists());
        assert!(builder.is_current(&image));
    }

    #[test]
    fn test_resolve_missing_binary() {
        let tmp = TempDir::new().unwrap();
        let builder = DriverRootfsBuilder::new(tmp.path());
        let err = builder.resolve_binary("/bin/missing").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
