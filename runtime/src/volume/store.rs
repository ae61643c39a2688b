//! Persistent storage for the volume registry.
//!
//! Records are kept in `<root>/volumes.json` with atomic writes (write to a
//! tmp file, then rename). Secrets are stored next to each record since the
//! record itself never serializes them; the file is created mode 0600.

use csi_proxy_core::error::{ProxyError, Result};
use csi_proxy_core::volume::VolumeRecord;
use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Persistent store for volume records.
#[derive(Debug)]
pub struct VolumeStore {
    path: PathBuf,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StoredVolume {
    #[serde(flatten)]
    record: VolumeRecord,
    #[serde(default, rename = "secretValues")]
    secrets: HashMap<String, String>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Default)]
struct VolumesFile {
    volumes: Vec<StoredVolume>,
}

impl VolumeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load all records; an absent file is an empty registry.
    pub fn load(&self) -> Result<HashMap<String, VolumeRecord>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            ProxyError::Other(format!(
                "failed to read volumes file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let file: VolumesFile = serde_json::from_str(&data)
            .map_err(|e| ProxyError::Other(format!("failed to parse volumes file: {}", e)))?;

        Ok(file
            .volumes
            .into_iter()
            .map(|stored| {
                let mut record = stored.record;
                record.secrets = stored.secrets;
                (record.name.clone(), record)
            })
            .collect())
    }

    /// Replace the file with `volumes` (atomic write).
    pub fn save(&self, volumes: &HashMap<String, VolumeRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ProxyError::Other(format!(
                    "failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let mut records: Vec<&VolumeRecord> = volumes.values().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        let file = VolumesFile {
            volumes: records
                .into_iter()
                .map(|record| StoredVolume {
                    secrets: record.secrets.clone(),
                    record: record.clone(),
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let tmp_path = self.path.with_extension("json.tmp");
        let write_tmp = || -> std::io::Result<()> {
            let mut tmp = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp_path)?;
            tmp.write_all(json.as_bytes())?;
            tmp.sync_all()
        };
        write_tmp().map_err(|e| {
            ProxyError::Other(format!(
                "failed to write tmp file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            ProxyError::Other(format!(
                "failed to rename {} → {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csi_proxy_core::volume::MountState;

    fn temp_store() -> (tempfile::TempDir, VolumeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = VolumeStore::new(dir.path().join("volumes.json"));
        (dir, store)
    }

    fn record(name: &str) -> VolumeRecord {
        VolumeRecord::new(
            name,
            "nfs",
            &format!("id-{}", name),
            PathBuf::from(format!("/v/{}/staging", name)),
            PathBuf::from(format!("/v/{}/mount", name)),
        )
    }

    #[test]
    fn test_load_empty() {
        let (_dir, store) = temp_store();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load_round_trip_keeps_secrets() {
        let (_dir, store) = temp_store();
        let mut vol = record("data");
        vol.state = MountState::Published;
        vol.options.insert("server".into(), "10.0.0.1".into());
        vol.secrets.insert("password".into(), "hunter2".into());

        let mut volumes = HashMap::new();
        volumes.insert(vol.name.clone(), vol);
        store.save(&volumes).unwrap();

        let loaded = store.load().unwrap();
        let vol = loaded.get("data").unwrap();
        assert_eq!(vol.state, MountState::Published);
        assert_eq!(vol.volume_id, "id-data");
        assert_eq!(vol.options.get("server").unwrap(), "10.0.0.1");
        assert_eq!(vol.secrets.get("password").unwrap(), "hunter2");
    }

    #[test]
    fn test_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, store) = temp_store();
        store.save(&HashMap::new()).unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_atomic_write() {
        let (_dir, store) = temp_store();
        let mut volumes = HashMap::new();
        volumes.insert("a".to_string(), record("a"));
        store.save(&volumes).unwrap();

        let data = std::fs::read_to_string(store.path()).unwrap();
        let _: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = VolumeStore::new(dir.path().join("subdir").join("volumes.json"));
        store.save(&HashMap::new()).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn test_corrupt_file() {
        let (_dir, store) = temp_store();
        std::fs::write(store.path(), "{ not json").unwrap();
        assert!(store.load().is_err());
    }
}
