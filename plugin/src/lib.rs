//! CSI Proxy volume plugin.
//!
//! Serves the volume-plugin protocol (HTTP/1.1 + JSON on a Unix socket) and
//! forwards each operation to the CSI drivers managed by the runtime.

pub mod api;
pub mod error;
pub mod handler;
pub mod server;

pub use handler::PluginHandler;
pub use server::PluginServer;

/// Default socket, discovered by the container runtime under this name.
pub const DEFAULT_SOCKET_PATH: &str = "/run/docker/plugins/csi-proxy.sock";
