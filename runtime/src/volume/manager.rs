//! Volume registry and lifecycle state machine.
//!
//! ```text
//! ∅ ──Create──► Created ──Mount──► Published ──Unmount──► Staged
//!                  │         (stage+publish)                │
//!                  │                    ▲      Mount        │
//!                  │                    └──(publish only)───┘
//!                  └────────── Remove (any state) ──────────► ∅
//! ```
//!
//! Registry access is two-phase: routing data is copied out under the read
//! lock, the CSI call runs unlocked, and the write lock is taken only to
//! commit. Mutating operations on one name are serialized by a per-volume
//! lock, so a slow driver call never blocks other volumes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use csi_proxy_core::config::ProxyConfig;
use csi_proxy_core::error::{ProxyError, Result};
use csi_proxy_core::volume::{MountState, VolumeRecord};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::merge::{merge_parameters, DRIVER_SELECTOR};
use super::store::VolumeStore;
use crate::csi::{CsiBackend, CsiConnector, GrpcConnector};
use crate::layout::ProxyLayout;
use crate::oci::RegistryAuth;
use crate::supervisor::{ChrootLauncher, DriverSupervisor, OciProvisioner, SystemClock};

/// Scope reported to the orchestrator.
pub const SCOPE_LOCAL: &str = "local";

/// Volume driver capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub scope: &'static str,
}

/// Authoritative registry of volumes.
pub struct VolumeManager {
    config: Arc<ProxyConfig>,
    layout: ProxyLayout,
    supervisor: Arc<DriverSupervisor>,
    connector: Arc<dyn CsiConnector>,
    clients: DashMap<String, Arc<dyn CsiBackend>>,
    registry: RwLock<HashMap<String, VolumeRecord>>,
    volume_locks: DashMap<String, Arc<Mutex<()>>>,
    store: Option<VolumeStore>,
}

impl VolumeManager {
    pub fn new(
        config: Arc<ProxyConfig>,
        layout: ProxyLayout,
        supervisor: Arc<DriverSupervisor>,
        connector: Arc<dyn CsiConnector>,
    ) -> Self {
        Self {
            config,
            layout,
            supervisor,
            connector,
            clients: DashMap::new(),
            registry: RwLock::new(HashMap::new()),
            volume_locks: DashMap::new(),
            store: None,
        }
    }

    /// Wire up the production stack: OCI provisioning, chroot launch, gRPC
    /// clients, and a registry persisted under the root directory.
    pub fn open(config: ProxyConfig) -> Result<Self> {
        let config = Arc::new(config);
        let layout = ProxyLayout::new(&config.root_dir);
        let provisioner = OciProvisioner::new(&layout.images_dir(), RegistryAuth::from_env())?;
        let supervisor = DriverSupervisor::new(
            config.clone(),
            layout.clone(),
            Arc::new(provisioner),
            Arc::new(ChrootLauncher),
            Arc::new(SystemClock::new()),
        );
        let connector = GrpcConnector::from_config(&config);
        let store = VolumeStore::new(layout.root().join("volumes.json"));
        Self::new(config, layout, Arc::new(supervisor), Arc::new(connector))
        .with_store(store)
    }

    /// Persist the registry in `store`, loading what it already holds.
    ///
    /// Records whose driver is no longer configured are dropped.
    pub fn with_store(mut self, store: VolumeStore) -> Result<Self> {
        let mut volumes = store.load()?;
        volumes.retain(|name, record| {
            let known = self.config.drivers.contains_key(&record.alias);
            if !known {
                tracing::warn!(
                    volume = %name,
                    alias = %record.alias,
                    "Dropping volume of unconfigured driver"
                );
            }
            known
        });
        tracing::info!(
            path = %store.path().display(),
            volumes = volumes.len(),
            "Loaded volume registry"
        );
        self.registry = RwLock::new(volumes);
        self.store = Some(store);
        Ok(self)
    }

    pub fn supervisor(&self) -> &Arc<DriverSupervisor> {
        &self.supervisor
    }

    /// Create a volume on the driver named by the `driver` option.
    ///
    /// Creating an existing name again with the same driver returns the
    /// existing record without contacting the driver.
    pub async fn create(&self, name: &str, opts: &HashMap<String, String>) -> Result<VolumeRecord> {
        validate_name(name)?;
        let alias = opts
            .get(DRIVER_SELECTOR)
            .filter(|alias| !alias.is_empty())
            .ok_or_else(|| {
                ProxyError::Usage(format!(
                    "volume '{}': option '{}' selecting the CSI driver is required",
                    name, DRIVER_SELECTOR
                ))
            })?;
        self.config.driver(alias)?;

        let _guard = self.lock_volume(name).await;
        let result = self.create_locked(name, alias, opts).await;
        if result.is_err() {
            self.release_lock(name);
        }
        result
    }

    async fn create_locked(
        &self,
        name: &str,
        alias: &str,
        opts: &HashMap<String, String>,
    ) -> Result<VolumeRecord> {
        let driver = self.config.driver(alias)?;
        if let Some(existing) = self.registry.read().await.get(name) {
            if existing.alias == *alias {
                return Ok(existing.clone());
            }
            return Err(ProxyError::Usage(format!(
                "volume '{}' already exists on driver '{}'",
                name, existing.alias
            )));
        }

        let (options, secrets) = merge_parameters(&driver.options, &driver.secrets, opts);
        let backend = self.backend(alias).await?;
        let created = backend.create_volume(name, &options, &secrets).await?;
        let volume_id = if created.volume_id.is_empty() {
            name.to_string()
        } else {
            created.volume_id
        };

        let staging_path = self.layout.staging_path(name);
        let mount_path = self.layout.mount_path(name);
        if let Err(e) = create_dirs(&staging_path, &mount_path).await {
            tracing::warn!(volume = %name, error = %e, "Rolling back CreateVolume");
            if let Err(rollback) = backend.delete_volume(&volume_id, &secrets).await {
                tracing::warn!(volume = %name, error = %rollback, "Rollback DeleteVolume failed");
            }
            return Err(e);
        }

        let mut record = VolumeRecord::new(name, alias, &volume_id, staging_path, mount_path);
        record.options = options;
        record.secrets = secrets;
        record.volume_context = created.volume_context;

        self.commit(|registry| {
            registry.insert(name.to_string(), record.clone());
        })
        .await;

        tracing::info!(
            volume = %name,
            alias = %alias,
            volume_id = %record.volume_id,
            "Volume created"
        );
        Ok(record)
    }

    /// Stage (first time only) and publish a volume; returns the mount path.
    pub async fn mount(&self, name: &str) -> Result<PathBuf> {
        let _guard = self.lock_existing(name).await?;
        let record = self.get(name).await?;
        let backend = self.backend(&record.alias).await?;
        let context = record.node_context();

        if !record.state.is_staged() {
            backend
                .node_stage_volume(&record.volume_id, &record.staging_path, &context, &record.secrets)
                .await?;
            self.set_state(name, MountState::Staged).await?;
            tracing::info!(volume = %name, "Volume staged");
        }

        backend
            .node_publish_volume(
                &record.volume_id,
                &record.staging_path,
                &record.mount_path,
                &context,
                &record.secrets,
            )
            .await?;
        self.set_state(name, MountState::Published).await?;

        tracing::info!(
            volume = %name,
            mountpoint = %record.mount_path.display(),
            "Volume published"
        );
        Ok(record.mount_path)
    }

    /// Unpublish a volume. It stays staged.
    pub async fn unmount(&self, name: &str) -> Result<()> {
        let _guard = self.lock_existing(name).await?;
        let record = self.get(name).await?;
        let backend = self.backend(&record.alias).await?;

        backend
            .node_unpublish_volume(&record.volume_id, &record.mount_path)
            .await?;

        if record.state == MountState::Published {
            self.set_state(name, MountState::Staged).await?;
        }
        tracing::info!(volume = %name, "Volume unpublished");
        Ok(())
    }

    /// Delete the backing CSI volume, then forget the record.
    ///
    /// On failure the record is kept so the removal can be retried.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let _guard = self.lock_existing(name).await?;
        let record = self.get(name).await?;
        let backend = self.backend(&record.alias).await?;

        backend
            .delete_volume(&record.volume_id, &record.secrets)
            .await?;

        self.commit(|registry| {
            registry.remove(name);
        })
        .await;
        self.release_lock(name);

        tracing::info!(volume = %name, alias = %record.alias, "Volume removed");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<VolumeRecord> {
        self.registry
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::VolumeNotFound(name.to_string()))
    }

    /// All volumes, ordered by name.
    pub async fn list(&self) -> Vec<VolumeRecord> {
        let mut volumes: Vec<VolumeRecord> = self.registry.read().await.values().cloned().collect();
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        volumes
    }

    /// Mount path if the volume is published, `None` otherwise.
    pub async fn path(&self, name: &str) -> Result<Option<PathBuf>> {
        Ok(self.get(name).await?.mountpoint().cloned())
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities { scope: SCOPE_LOCAL }
    }

    async fn lock_volume(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.volume_locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        lock.lock_owned().await
    }

    /// Lock a registered volume without leaving a lock behind for unknown names.
    async fn lock_existing(&self, name: &str) -> Result<OwnedMutexGuard<()>> {
        if !self.registry.read().await.contains_key(name) {
            return Err(ProxyError::VolumeNotFound(name.to_string()));
        }
        let guard = self.lock_volume(name).await;
        if !self.registry.read().await.contains_key(name) {
            self.release_lock(name);
            return Err(ProxyError::VolumeNotFound(name.to_string()));
        }
        Ok(guard)
    }

    /// Drop the lock entry for `name` unless another caller is waiting on it.
    /// Must be called while holding that lock's guard.
    fn release_lock(&self, name: &str) {
        // One reference in the map, one in the caller's guard.
        self.volume_locks
            .remove_if(name, |_, lock| Arc::strong_count(lock) == 2);
    }

    /// Running driver for `alias` and a client bound to it.
    async fn backend(&self, alias: &str) -> Result<Arc<dyn CsiBackend>> {
        let endpoint = self.supervisor.ensure_running(alias).await?;
        if let Some(client) = self.clients.get(alias) {
            return Ok(Arc::clone(client.value()));
        }
        let client = self.connector.connect(&endpoint).await?;
        self.clients.insert(alias.to_string(), Arc::clone(&client));
        Ok(client)
    }

    async fn set_state(&self, name: &str, state: MountState) -> Result<()> {
        let mut found = false;
        self.commit(|registry| {
            if let Some(record) = registry.get_mut(name) {
                record.state = state;
                found = true;
            }
        })
        .await;
        if found {
            Ok(())
        } else {
            Err(ProxyError::VolumeNotFound(name.to_string()))
        }
    }

    /// Apply `f` under the write lock and persist the result.
    ///
    /// The in-memory registry follows the driver's confirmed state even if
    /// the write to disk fails.
    async fn commit<F>(&self, f: F)
    where
        F: FnOnce(&mut HashMap<String, VolumeRecord>),
    {
        let mut registry = self.registry.write().await;
        f(&mut registry);
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&registry) {
                tracing::warn!(error = %e, "Failed to persist volume registry");
            }
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(ProxyError::Usage(format!("invalid volume name '{}'", name)));
    }
    Ok(())
}

async fn create_dirs(staging: &std::path::Path, mount: &std::path::Path) -> Result<()> {
    tokio::fs::create_dir_all(staging).await?;
    tokio::fs::create_dir_all(mount).await?;
    Ok(())
}
