//! OCI image support for driver provisioning.
//!
//! Driver images are pulled once into a content store, then unpacked into
//! a per-driver rootfs:
//!
//! ```text
//! <root>/images/
//! ├── index.json              (reference → digest index)
//! ├── tmp/                    (in-progress pulls)
//! └── sha256/<digest>/        (OCI image layout)
//!     ├── oci-layout
//!     ├── index.json
//!     └── blobs/sha256/...
//! ```

pub(crate) mod image;
pub(crate) mod layers;
mod pull;
pub mod reference;
pub mod registry;
mod rootfs;
pub mod store;

pub use image::OciImage;
pub use layers::extract_layer;
pub use pull::ImagePuller;
pub use reference::ImageReference;
pub use registry::{RegistryAuth, RegistryPuller};
pub use rootfs::DriverRootfsBuilder;
pub use store::{ImageStore, StoredImage};
