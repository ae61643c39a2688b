//! Driver supervisor - lazy bring-up of CSI driver processes.
//!
//! Each configured alias gets at most one running driver. The first caller
//! for a cold alias pulls the image, unpacks it, launches the binary and
//! waits for its socket; concurrent callers for the same alias wait on the
//! alias lock and share the result. Different aliases never contend.
//!
//! ```text
//! Absent ──ensure_running──► Starting ──socket seen──► Ready
//!    ▲                           │
//!    └──── next call ◄── Failed ◄┘ (pull / unpack / launch / timeout)
//! ```

pub mod clock;
pub mod launcher;
pub mod provision;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use csi_proxy_core::config::{DriverDefinition, ProxyConfig};
use csi_proxy_core::driver::DriverState;
use csi_proxy_core::error::{ProxyError, Result};
use dashmap::DashMap;

use crate::layout::ProxyLayout;

pub use clock::{Clock, ManualClock, SystemClock};
pub use launcher::{driver_args, ChrootLauncher, DriverLauncher, DriverProcess, LaunchSpec};
pub use provision::{ImageProvisioner, OciProvisioner};

/// Interval between socket existence checks.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a freshly launched driver has to create its socket.
pub const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Running (or last attempted) driver for one alias.
struct DriverInstance {
    alias: String,
    endpoint: PathBuf,
    process: Option<Box<dyn DriverProcess>>,
}

impl DriverInstance {
    fn is_alive(&mut self) -> bool {
        let exited = self.process.as_mut().is_some_and(|p| p.has_exited());
        !exited && self.endpoint.exists()
    }

    /// Kill the process and drop its socket.
    fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            tracing::debug!(alias = %self.alias, pid = ?process.pid(), "Stopping driver process");
            process.kill();
        }
        if self.endpoint.exists() {
            let _ = std::fs::remove_file(&self.endpoint);
        }
    }
}

struct DriverSlot {
    state: parking_lot::Mutex<DriverState>,
    instance: tokio::sync::Mutex<DriverInstance>,
}

impl DriverSlot {
    fn set_state(&self, state: DriverState) {
        *self.state.lock() = state;
    }
}

/// Ensures one reachable driver instance per alias.
pub struct DriverSupervisor {
    config: Arc<ProxyConfig>,
    layout: ProxyLayout,
    provisioner: Arc<dyn ImageProvisioner>,
    launcher: Arc<dyn DriverLauncher>,
    clock: Arc<dyn Clock>,
    slots: DashMap<String, Arc<DriverSlot>>,
    poll_interval: Duration,
    ready_timeout: Duration,
}

impl DriverSupervisor {
    pub fn new(
        config: Arc<ProxyConfig>,
        layout: ProxyLayout,
        provisioner: Arc<dyn ImageProvisioner>,
        launcher: Arc<dyn DriverLauncher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            layout,
            provisioner,
            launcher,
            clock,
            slots: DashMap::new(),
            poll_interval: READY_POLL_INTERVAL,
            ready_timeout: READY_TIMEOUT,
        }
    }

    /// Override the readiness poll interval and deadline.
    pub fn with_readiness(mut self, poll_interval: Duration, ready_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.ready_timeout = ready_timeout;
        self
    }

    /// Return the socket of a running driver for `alias`, starting it if needed.
    ///
    /// A Ready driver whose socket disappeared or whose process exited is
    /// started again. Failures leave the alias `Failed`; the next call
    /// retries from scratch.
    pub async fn ensure_running(&self, alias: &str) -> Result<PathBuf> {
        let driver = self.config.driver(alias)?;
        let slot = self.slot(alias);
        let mut instance = slot.instance.lock().await;

        if *slot.state.lock() == DriverState::Ready {
            if instance.is_alive() {
                return Ok(instance.endpoint.clone());
            }
            tracing::warn!(
                alias = %alias,
                endpoint = %instance.endpoint.display(),
                "Driver is gone, starting it again"
            );
            instance.stop();
        }

        slot.set_state(DriverState::Starting);
        match self.bring_up(driver, &mut instance).await {
            Ok(()) => {
                slot.set_state(DriverState::Ready);
                tracing::info!(
                    alias = %alias,
                    endpoint = %instance.endpoint.display(),
                    "Driver ready"
                );
                Ok(instance.endpoint.clone())
            }
            Err(e) => {
                instance.stop();
                slot.set_state(DriverState::Failed);
                tracing::warn!(alias = %alias, error = %e, "Driver bring-up failed");
                Err(e)
            }
        }
    }

    /// Lifecycle state of `alias`; `Absent` if never attempted.
    pub fn state(&self, alias: &str) -> DriverState {
        self.slots
            .get(alias)
            .map(|slot| *slot.state.lock())
            .unwrap_or_default()
    }

    /// Host path of the socket `alias` listens on once running.
    pub fn endpoint_path(&self, alias: &str) -> PathBuf {
        self.layout.driver_socket(alias)
    }

    fn slot(&self, alias: &str) -> Arc<DriverSlot> {
        let entry = self.slots.entry(alias.to_string()).or_insert_with(|| {
            Arc::new(DriverSlot {
                state: parking_lot::Mutex::new(DriverState::Absent),
                instance: tokio::sync::Mutex::new(DriverInstance {
                    alias: alias.to_string(),
                    endpoint: self.layout.driver_socket(alias),
                    process: None,
                }),
            })
        });
        Arc::clone(entry.value())
    }

    async fn bring_up(&self, driver: &DriverDefinition, instance: &mut DriverInstance) -> Result<()> {
        let rootfs = self.layout.driver_rootfs(&driver.alias);
        let binary = self.provisioner.provision(driver, &rootfs).await?;
        tracing::debug!(
            alias = %driver.alias,
            binary = %binary.display(),
            "Driver binary resolved"
        );

        if let Some(dir) = instance.endpoint.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        if instance.endpoint.exists() {
            tracing::warn!(
                path = %instance.endpoint.display(),
                "Removing stale driver socket"
            );
            tokio::fs::remove_file(&instance.endpoint).await?;
        }

        let spec = LaunchSpec::new(&self.layout, self.config.node_id(), driver);
        instance.process = Some(self.launcher.launch(&spec).await?);

        self.wait_for_socket(instance).await
    }

    async fn wait_for_socket(&self, instance: &mut DriverInstance) -> Result<()> {
        let start = self.clock.now();
        loop {
            if instance.endpoint.exists() {
                return Ok(());
            }

            if instance.process.as_mut().is_some_and(|p| p.has_exited()) {
                return Err(ProxyError::LaunchError {
                    alias: instance.alias.clone(),
                    message: format!(
                        "driver exited before creating {}; see {}",
                        instance.endpoint.display(),
                        self.layout.driver_log(&instance.alias).display()
                    ),
                });
            }

            if self.clock.now().saturating_sub(start) >= self.ready_timeout {
                return Err(ProxyError::TimeoutError(format!(
                    "driver '{}' did not create {} within {:?}",
                    instance.alias,
                    instance.endpoint.display(),
                    self.ready_timeout
                )));
            }

            self.clock.sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process stand-ins for image provisioning and process launch.

    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Creates an empty rootfs with the binary in place.
    #[derive(Default)]
    pub struct MockProvisioner {
        pub calls: AtomicUsize,
        pub fail: AtomicBool,
    }

    #[async_trait]
    impl ImageProvisioner for MockProvisioner {
        async fn provision(&self, driver: &DriverDefinition, rootfs: &Path) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ProxyError::RegistryError {
                    registry: "registry.example".to_string(),
                    message: "unreachable".to_string(),
                });
            }
            let binary = rootfs.join(driver.bin_path.trim_start_matches('/'));
            if let Some(parent) = binary.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&binary, b"")?;
            Ok(binary)
        }
    }

    pub struct MockProcess {
        pub exited: bool,
        pub killed: Arc<AtomicUsize>,
    }

    impl DriverProcess for MockProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn has_exited(&mut self) -> bool {
            self.exited
        }

        fn kill(&mut self) {
            self.killed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Creates the socket file on launch unless told to stay silent.
    pub struct MockLauncher {
        pub launches: AtomicUsize,
        pub create_socket: AtomicBool,
        pub exit_immediately: AtomicBool,
        pub killed: Arc<AtomicUsize>,
        pub specs: parking_lot::Mutex<Vec<LaunchSpec>>,
    }

    impl Default for MockLauncher {
        fn default() -> Self {
            Self {
                launches: AtomicUsize::new(0),
                create_socket: AtomicBool::new(true),
                exit_immediately: AtomicBool::new(false),
                killed: Arc::new(AtomicUsize::new(0)),
                specs: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DriverLauncher for MockLauncher {
        async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn DriverProcess>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            self.specs.lock().push(spec.clone());
            // Give concurrent callers a chance to pile up on the alias lock.
            tokio::task::yield_now().await;
            if self.create_socket.load(Ordering::SeqCst) {
                let socket = spec
                    .rootfs
                    .join(ProxyLayout::driver_socket_in_rootfs(&spec.alias).trim_start_matches('/'));
                std::fs::write(socket, b"")?;
            }
            Ok(Box::new(MockProcess {
                exited: self.exit_immediately.load(Ordering::SeqCst),
                killed: Arc::clone(&self.killed),
            }))
        }
    }

    pub fn config_with(aliases: &[&str]) -> ProxyConfig {
        let mut config = ProxyConfig {
            node_id: Some("node-1".to_string()),
            ..Default::default()
        };
        for alias in aliases {
            config.drivers.insert(
                alias.to_string(),
                DriverDefinition {
                    alias: alias.to_string(),
                    image: format!("registry.example/{}-csi:1.0", alias),
                    bin_path: format!("/bin/{}plugin", alias),
                    driver_name: format!("{}.csi.example", alias),
                    ..Default::default()
                },
            );
        }
        config
    }

    pub fn supervisor(
        root: &Path,
        config: ProxyConfig,
        provisioner: Arc<MockProvisioner>,
        launcher: Arc<MockLauncher>,
        clock: Arc<ManualClock>,
    ) -> DriverSupervisor {
        DriverSupervisor::new(
            Arc::new(config),
            ProxyLayout::new(root),
            provisioner,
            launcher,
            clock,
        )
    }
}
