//! On-disk layout of the proxy's state directory.
//!
//! ```text
//! <root>/
//! ├── images/                       (driver image store)
//! ├── drivers/<alias>/
//! │   ├── <alias>.log               (driver stdout + stderr)
//! │   └── rootfs/                   (chroot tree)
//! │       └── run/csi/<alias>.sock  (CSI endpoint)
//! └── volumes/<name>/
//!     ├── staging/
//!     └── mount/
//! ```

use std::path::{Path, PathBuf};

/// Directory inside a driver rootfs that holds its CSI socket.
pub const DRIVER_SOCKET_DIR: &str = "/run/csi";

/// Path helper for the state directory.
#[derive(Debug, Clone)]
pub struct ProxyLayout {
    root: PathBuf,
}

impl ProxyLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Driver image store.
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Per-driver state directory.
    pub fn driver_dir(&self, alias: &str) -> PathBuf {
        self.root.join("drivers").join(alias)
    }

    /// Chroot tree the driver runs in.
    pub fn driver_rootfs(&self, alias: &str) -> PathBuf {
        self.driver_dir(alias).join("rootfs")
    }

    pub fn driver_log(&self, alias: &str) -> PathBuf {
        self.driver_dir(alias).join(format!("{}.log", alias))
    }

    /// Socket path as seen from inside the chroot.
    pub fn driver_socket_in_rootfs(alias: &str) -> String {
        format!("{}/{}.sock", DRIVER_SOCKET_DIR, alias)
    }

    /// `--endpoint` value handed to the driver.
    pub fn driver_endpoint_url(alias: &str) -> String {
        format!("unix://{}", Self::driver_socket_in_rootfs(alias))
    }

    /// Socket path as seen from the host.
    pub fn driver_socket(&self, alias: &str) -> PathBuf {
        self.driver_rootfs(alias)
            .join(Self::driver_socket_in_rootfs(alias).trim_start_matches('/'))
    }

    pub fn volume_dir(&self, name: &str) -> PathBuf {
        self.root.join("volumes").join(name)
    }

    pub fn staging_path(&self, name: &str) -> PathBuf {
        self.volume_dir(name).join("staging")
    }

    pub fn mount_path(&self, name: &str) -> PathBuf {
        self.volume_dir(name).join("mount")
    }
}
