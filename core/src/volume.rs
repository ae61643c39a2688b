//! Volume types for the proxy's volume registry.
//!
//! A `VolumeRecord` exists only for volumes whose backing CSI volume was
//! confirmed created by the owning driver.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Lifecycle state of a registered volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountState {
    /// CreateVolume succeeded; nothing staged yet.
    Created,
    /// NodeStageVolume succeeded.
    Staged,
    /// NodePublishVolume succeeded.
    Published,
}

impl MountState {
    /// Whether NodeStageVolume has already been issued for this volume.
    pub fn is_staged(self) -> bool {
        matches!(self, MountState::Staged | MountState::Published)
    }
}

impl std::fmt::Display for MountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountState::Created => write!(f, "created"),
            MountState::Staged => write!(f, "staged"),
            MountState::Published => write!(f, "published"),
        }
    }
}

/// A volume known to the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    /// Volume name (unique key).
    pub name: String,

    /// Alias of the owning driver.
    pub alias: String,

    /// Volume id assigned by the CSI driver.
    pub volume_id: String,

    /// Merged, non-secret options.
    #[serde(default)]
    pub options: HashMap<String, String>,

    /// Merged secrets.
    #[serde(default, skip_serializing)]
    pub secrets: HashMap<String, String>,

    /// Volume context returned by CreateVolume.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,

    /// Current lifecycle state.
    pub state: MountState,

    /// Node-local staging directory.
    pub staging_path: PathBuf,

    /// Node-local mount directory.
    pub mount_path: PathBuf,

    /// Creation timestamp (RFC 3339).
    pub created_at: String,
}

impl VolumeRecord {
    /// Create a new record in the `Created` state.
    pub fn new(
        name: &str,
        alias: &str,
        volume_id: &str,
        staging_path: PathBuf,
        mount_path: PathBuf,
    ) -> Self {
        Self {
            name: name.to_string(),
            alias: alias.to_string(),
            volume_id: volume_id.to_string(),
            options: HashMap::new(),
            secrets: HashMap::new(),
            volume_context: HashMap::new(),
            state: MountState::Created,
            staging_path,
            mount_path,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Context sent with node RPCs: merged options overlaid with the driver's context.
    pub fn node_context(&self) -> HashMap<String, String> {
        let mut context = self.options.clone();
        context.extend(
            self.volume_context
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        context
    }

    /// Mount point reported to the orchestrator; empty until published.
    pub fn mountpoint(&self) -> Option<&PathBuf> {
        (self.state == MountState::Published).then_some(&self.mount_path)
    }
}
