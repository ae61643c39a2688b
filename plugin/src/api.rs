//! Volume-plugin wire types.
//!
//! Field names follow the plugin protocol (`Name`, `Opts`, `Mountpoint`,
//! `Err`); every response carries `Err`, empty on success.

use std::collections::HashMap;

use csi_proxy_core::volume::VolumeRecord;
use serde::{Deserialize, Serialize};

/// Content type of every plugin response.
pub const CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1.2+json";

/// Subsystem implemented by this plugin.
pub const IMPLEMENTS: &str = "VolumeDriver";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateRequest {
    pub name: String,
    #[serde(default)]
    pub opts: Option<HashMap<String, String>>,
}

/// Body of Remove, Get and Path.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NameRequest {
    pub name: String,
}

/// Body of Mount and Unmount; `ID` identifies the caller.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountRequest {
    pub name: String,
    #[serde(default, rename = "ID")]
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActivateResponse {
    pub implements: Vec<&'static str>,
}

impl Default for ActivateResponse {
    fn default() -> Self {
        Self {
            implements: vec![IMPLEMENTS],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrResponse {
    pub err: String,
}

impl ErrResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            err: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountpointResponse {
    pub mountpoint: String,
    pub err: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Volume {
    pub name: String,
    pub mountpoint: String,
    pub created_at: String,
    pub status: HashMap<String, String>,
}

impl From<&VolumeRecord> for Volume {
    fn from(record: &VolumeRecord) -> Self {
        let status = HashMap::from([
            ("driver".to_string(), record.alias.clone()),
            ("volumeId".to_string(), record.volume_id.clone()),
            ("state".to_string(), record.state.to_string()),
        ]);
        Self {
            name: record.name.clone(),
            mountpoint: record
                .mountpoint()
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
            created_at: record.created_at.clone(),
            status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetResponse {
    pub volume: Volume,
    pub err: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListResponse {
    pub volumes: Vec<Volume>,
    pub err: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Capability {
    pub scope: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapabilitiesResponse {
    pub capabilities: Capability,
}

#[cfg(test)]
mod tests {
    use super::*;
    use csi_proxy_core::volume::MountState;
    use std::path::PathBuf;

    #[test]
    fn test_create_request_accepts_null_opts() {
        let req: CreateRequest = serde_json::from_str(r#"{"Name":"data","Opts":null}"#).unwrap();
        assert_eq!(req.name, "data");
        assert!(req.opts.is_none());

        let req: CreateRequest =
            serde_json::from_str(r#"{"Name":"data","Opts":{"driver":"nfs"}}"#).unwrap();
        assert_eq!(req.opts.unwrap().get("driver").unwrap(), "nfs");
    }

    #[test]
    fn test_mount_request_id() {
        let req: MountRequest = serde_json::from_str(r#"{"Name":"data","ID":"abc"}"#).unwrap();
        assert_eq!(req.id, "abc");
    }

    #[test]
    fn test_volume_mountpoint_only_when_published() {
        let mut record = VolumeRecord::new(
            "data",
            "nfs",
            "vol-1",
            PathBuf::from("/v/data/staging"),
            PathBuf::from("/v/data/mount"),
        );
        let json = serde_json::to_value(Volume::from(&record)).unwrap();
        assert_eq!(json["Name"], "data");
        assert_eq!(json["Mountpoint"], "");
        assert_eq!(json["Status"]["driver"], "nfs");

        record.state = MountState::Published;
        let json = serde_json::to_value(Volume::from(&record)).unwrap();
        assert_eq!(json["Mountpoint"], "/v/data/mount");
        assert_eq!(json["Status"]["state"], "published");
    }

    #[test]
    fn test_activate_response() {
        let json = serde_json::to_string(&ActivateResponse::default()).unwrap();
        assert_eq!(json, r#"{"Implements":["VolumeDriver"]}"#);
    }
}
