//! CSI Proxy Core - Foundational Types
//!
//! Configuration, volume records, driver lifecycle states and the error type
//! shared by the runtime and the volume-plugin server.

pub mod config;
pub mod driver;
pub mod error;
pub mod volume;

// Re-export commonly used types
pub use config::{DriverDefinition, ProxyConfig};
pub use driver::DriverState;
pub use error::{ProxyError, Result};
pub use volume::{MountState, VolumeRecord};

/// CSI Proxy version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
