//! CSI v1 client for driver instances.

mod client;
#[allow(clippy::all)]
pub mod proto;

pub use client::{
    mount_capability, CreatedVolume, CsiBackend, CsiConnector, CsiServiceClient, GrpcConnector,
    FS_TYPE,
};
