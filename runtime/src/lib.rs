//! CSI Proxy Runtime.
//!
//! Runs CSI node plugins out of OCI images and drives them through the
//! volume lifecycle: image provisioning, chroot launch and supervision,
//! the CSI gRPC client and the volume registry.

#![allow(clippy::result_large_err)]

pub mod csi;
pub mod layout;
pub mod oci;
pub mod supervisor;
pub mod volume;

// Re-export common types
pub use csi::{CsiBackend, CsiConnector, CsiServiceClient, GrpcConnector};
pub use layout::ProxyLayout;
pub use oci::{ImagePuller, ImageReference, ImageStore, OciImage, RegistryAuth, RegistryPuller};
pub use supervisor::{
    ChrootLauncher, Clock, DriverLauncher, DriverProcess, DriverSupervisor, ImageProvisioner,
    LaunchSpec, ManualClock, OciProvisioner, SystemClock,
};
pub use volume::{Capabilities, VolumeManager, VolumeStore};

/// CSI Proxy Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
