//! Driver process launch.
//!
//! The production launcher execs the driver binary chrooted into its
//! unpacked rootfs, appending stdout and stderr to the per-alias log.

use std::fs::OpenOptions;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use csi_proxy_core::config::DriverDefinition;
use csi_proxy_core::error::{ProxyError, Result};
use tokio::process::{Child, Command};

use crate::layout::ProxyLayout;

/// Everything needed to start one driver process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub alias: String,
    /// Host path of the chroot tree
    pub rootfs: PathBuf,
    /// Binary path inside the chroot
    pub binary: String,
    pub args: Vec<String>,
    /// Host path of the log file
    pub log_path: PathBuf,
}

impl LaunchSpec {
    pub fn new(layout: &ProxyLayout, node_id: &str, driver: &DriverDefinition) -> Self {
        Self {
            alias: driver.alias.clone(),
            rootfs: layout.driver_rootfs(&driver.alias),
            binary: driver.bin_path.clone(),
            args: driver_args(node_id, driver),
            log_path: layout.driver_log(&driver.alias),
        }
    }
}

/// Command line handed to a CSI driver.
pub fn driver_args(node_id: &str, driver: &DriverDefinition) -> Vec<String> {
    let mut args = vec![
        "--nodeid".to_string(),
        node_id.to_string(),
        "--endpoint".to_string(),
        ProxyLayout::driver_endpoint_url(&driver.alias),
        "--drivername".to_string(),
        driver.driver_name.clone(),
    ];
    args.extend(driver.start_args.iter().cloned());
    args
}

/// Handle to a launched driver.
pub trait DriverProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Whether the process has terminated.
    fn has_exited(&mut self) -> bool;

    fn kill(&mut self);
}

/// Starts driver processes.
#[async_trait]
pub trait DriverLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn DriverProcess>>;
}

/// Launches drivers with `chroot(2)` into their rootfs.
#[derive(Debug, Default)]
pub struct ChrootLauncher;

#[async_trait]
impl DriverLauncher for ChrootLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn DriverProcess>> {
        let launch_error = |message: String| ProxyError::LaunchError {
            alias: spec.alias.clone(),
            message,
        };

        if let Some(parent) = spec.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)
            .map_err(|e| launch_error(format!("open log {}: {}", spec.log_path.display(), e)))?;
        let log_err = log
            .try_clone()
            .map_err(|e| launch_error(format!("clone log handle: {}", e)))?;

        let root = std::ffi::CString::new(spec.rootfs.as_os_str().as_bytes())
            .map_err(|e| launch_error(format!("invalid rootfs path: {}", e)))?;

        let mut cmd = Command::new(&spec.binary);
        cmd.args(&spec.args)
            .env_clear()
            .env("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        // SAFETY: only async-signal-safe libc calls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if libc::chroot(root.as_ptr()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::chdir(b"/\0".as_ptr() as *const libc::c_char) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| launch_error(format!("spawn {}: {}", spec.binary, e)))?;

        tracing::info!(
            alias = %spec.alias,
            pid = ?child.id(),
            binary = %spec.binary,
            args = ?spec.args,
            log = %spec.log_path.display(),
            "Driver process spawned"
        );

        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

impl DriverProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    fn kill(&mut self) {
        let pid = self.child.id();
        if let Err(e) = self.child.start_kill() {
            tracing::warn!(pid = ?pid, error = %e, "Failed to kill driver process");
            return;
        }
        // Reap if it already exited to avoid zombies.
        let _ = self.child.try_wait();
        tracing::info!(pid = ?pid, "Driver process killed");
    }
}
