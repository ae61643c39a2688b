//! Proxy configuration.
//!
//! Loaded once at startup from a JSON file (default
//! `/etc/docker/csi-proxy.json`). Each entry under `drivers` describes one CSI
//! driver image that can be launched on demand under its alias.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::{ProxyError, Result};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/docker/csi-proxy.json";

/// Default state directory for volumes, driver rootfs trees and images.
pub const DEFAULT_ROOT_DIR: &str = "/var/lib/csi-proxy";

/// Top-level proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Root directory holding volumes, driver trees and the image store
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Environment variable holding this node's identity
    #[serde(default)]
    pub node_id_env_var: Option<String>,

    /// Node identity passed to drivers; resolved at load time when unset
    #[serde(default)]
    pub node_id: Option<String>,

    /// gRPC deadline for each CSI call, in seconds; no deadline when unset
    #[serde(default)]
    pub csi_timeout_secs: Option<u64>,

    /// Driver definitions keyed by alias
    #[serde(default)]
    pub drivers: BTreeMap<String, DriverDefinition>,
}

/// One configured CSI driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverDefinition {
    /// Alias, filled from the map key on load
    #[serde(default, skip_serializing)]
    pub alias: String,

    /// Image reference (e.g. `registry.k8s.io/sig-storage/nfsplugin:v4.6.0`)
    pub image: String,

    /// Path of the driver binary inside the image
    pub bin_path: String,

    /// CSI driver name passed as `--drivername`
    pub driver_name: String,

    /// Default volume options
    #[serde(default)]
    pub options: HashMap<String, String>,

    /// Default secrets; the key set also decides which request options are secret
    #[serde(default)]
    pub secrets: HashMap<String, String>,

    /// Extra arguments appended to the driver command line
    #[serde(default, alias = "startCommand")]
    pub start_args: Vec<String>,
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(DEFAULT_ROOT_DIR)
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            node_id_env_var: None,
            node_id: None,
            csi_timeout_secs: None,
            drivers: BTreeMap::new(),
        }
    }
}

impl ProxyConfig {
    /// Load and validate configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigError(format!("could not read {}: {}", path.display(), e))
        })?;
        Self::from_json(&data)
    }

    /// Parse and validate configuration from a JSON string.
    pub fn from_json(data: &str) -> Result<Self> {
        let mut config: ProxyConfig = serde_json::from_str(data)
            .map_err(|e| ProxyError::ConfigError(format!("invalid config format: {}", e)))?;

        for (alias, driver) in config.drivers.iter_mut() {
            driver.alias = alias.clone();
        }
        config.validate()?;
        config.resolve_node_id();
        Ok(config)
    }

    /// Reject driver entries that cannot possibly be launched.
    pub fn validate(&self) -> Result<()> {
        for (alias, driver) in &self.drivers {
            if alias.is_empty() || alias.contains('/') {
                return Err(ProxyError::ConfigError(format!(
                    "invalid driver alias '{}'",
                    alias
                )));
            }
            let missing = if driver.image.is_empty() {
                Some("image")
            } else if driver.bin_path.is_empty() {
                Some("binPath")
            } else if driver.driver_name.is_empty() {
                Some("driverName")
            } else {
                None
            };
            if let Some(field) = missing {
                return Err(ProxyError::ConfigError(format!(
                    "driver '{}' is missing '{}'",
                    alias, field
                )));
            }
        }
        Ok(())
    }

    /// Fill `node_id` from the configured env var, falling back to the hostname.
    fn resolve_node_id(&mut self) {
        if self.node_id.as_deref().is_some_and(|id| !id.is_empty()) {
            return;
        }
        let from_env = self
            .node_id_env_var
            .as_deref()
            .filter(|var| !var.is_empty())
            .and_then(|var| std::env::var(var).ok())
            .filter(|id| !id.is_empty());
        self.node_id = Some(from_env.unwrap_or_else(hostname));
    }

    /// Node identity handed to drivers.
    pub fn node_id(&self) -> &str {
        self.node_id.as_deref().unwrap_or("localhost")
    }

    /// Look up a driver by alias.
    pub fn driver(&self, alias: &str) -> Result<&DriverDefinition> {
        self.drivers
            .get(alias)
            .ok_or_else(|| ProxyError::UnknownDriver(alias.to_string()))
    }
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the length passed never exceeds the buffer.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len() - 1) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    match String::from_utf8_lossy(&buf[..len]).trim() {
        "" => "localhost".to_string(),
        name => name.to_string(),
    }
}
