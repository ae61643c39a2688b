//! Routes volume-plugin requests to the volume registry.

use std::sync::Arc;

use csi_proxy_runtime::VolumeManager;
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE as CONTENT_TYPE_HEADER;
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::{
    ActivateResponse, CapabilitiesResponse, Capability, CreateRequest, ErrResponse, GetResponse,
    ListResponse, MountRequest, MountpointResponse, NameRequest, Volume, CONTENT_TYPE,
};
use crate::error::PluginError;

/// Answers plugin requests against one [`VolumeManager`].
#[derive(Clone)]
pub struct PluginHandler {
    manager: Arc<VolumeManager>,
}

impl PluginHandler {
    pub fn new(manager: Arc<VolumeManager>) -> Self {
        Self { manager }
    }

    /// Serve one HTTP request. Failures become `{"Err": ...}` bodies.
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path().to_string();
        let result = if req.method() != Method::POST {
            Err(PluginError::MethodNotAllowed(req.method().to_string()))
        } else {
            match hyper::body::to_bytes(req.into_body()).await {
                Ok(body) => self.dispatch(&path, &body).await,
                Err(e) => Err(PluginError::BadRequest(e.to_string())),
            }
        };

        match result {
            Ok(body) => {
                tracing::debug!(endpoint = %path, "Plugin request served");
                json_response(StatusCode::OK, body)
            }
            Err(e) => {
                tracing::warn!(endpoint = %path, error = %e, "Plugin request failed");
                let body = serde_json::to_vec(&ErrResponse::new(e.to_string())).unwrap_or_default();
                json_response(e.status(), body)
            }
        }
    }

    /// Run the operation behind `path` and serialize its response.
    pub async fn dispatch(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, PluginError> {
        match path {
            "/Plugin.Activate" => to_json(&ActivateResponse::default()),
            "/VolumeDriver.Create" => {
                let req: CreateRequest = parse(body)?;
                let opts = req.opts.unwrap_or_default();
                self.manager.create(&req.name, &opts).await?;
                to_json(&ErrResponse::default())
            }
            "/VolumeDriver.Remove" => {
                let req: NameRequest = parse(body)?;
                self.manager.remove(&req.name).await?;
                to_json(&ErrResponse::default())
            }
            "/VolumeDriver.Mount" => {
                let req: MountRequest = parse(body)?;
                tracing::debug!(volume = %req.name, caller = %req.id, "Mount requested");
                let mountpoint = self.manager.mount(&req.name).await?;
                to_json(&MountpointResponse {
                    mountpoint: mountpoint.display().to_string(),
                    err: String::new(),
                })
            }
            "/VolumeDriver.Unmount" => {
                let req: MountRequest = parse(body)?;
                tracing::debug!(volume = %req.name, caller = %req.id, "Unmount requested");
                self.manager.unmount(&req.name).await?;
                to_json(&ErrResponse::default())
            }
            "/VolumeDriver.Path" => {
                let req: NameRequest = parse(body)?;
                let mountpoint = self.manager.path(&req.name).await?;
                to_json(&MountpointResponse {
                    mountpoint: mountpoint
                        .map(|path| path.display().to_string())
                        .unwrap_or_default(),
                    err: String::new(),
                })
            }
            "/VolumeDriver.Get" => {
                let req: NameRequest = parse(body)?;
                let record = self.manager.get(&req.name).await?;
                to_json(&GetResponse {
                    volume: Volume::from(&record),
                    err: String::new(),
                })
            }
            "/VolumeDriver.List" => {
                let volumes = self.manager.list().await;
                to_json(&ListResponse {
                    volumes: volumes.iter().map(Volume::from).collect(),
                    err: String::new(),
                })
            }
            "/VolumeDriver.Capabilities" => to_json(&CapabilitiesResponse {
                capabilities: Capability {
                    scope: self.manager.capabilities().scope.to_string(),
                },
            }),
            other => Err(PluginError::UnknownEndpoint(other.to_string())),
        }
    }
}

fn parse<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, PluginError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(body)?)
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, PluginError> {
    Ok(serde_json::to_vec(value)?)
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<Body> {
    let mut response = Response::new(Body::from(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE_HEADER,
        hyper::header::HeaderValue::from_static(CONTENT_TYPE),
    );
    response
}

#[cfg(test)]
pub(crate) mod testing {
    //! A volume registry wired to in-process drivers.

    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use async_trait::async_trait;
    use csi_proxy_core::config::{DriverDefinition, ProxyConfig};
    use csi_proxy_core::error::{ProxyError, Result};
    use csi_proxy_runtime::csi::CreatedVolume;
    use csi_proxy_runtime::{
        CsiBackend, CsiConnector, DriverLauncher, DriverProcess, DriverSupervisor,
        ImageProvisioner, LaunchSpec, ManualClock, ProxyLayout, VolumeManager,
    };

    struct Rootfs;

    #[async_trait]
    impl ImageProvisioner for Rootfs {
        async fn provision(&self, driver: &DriverDefinition, rootfs: &Path) -> Result<PathBuf> {
            let binary = rootfs.join(driver.bin_path.trim_start_matches('/'));
            if let Some(parent) = binary.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&binary, b"")?;
            Ok(binary)
        }
    }

    struct Running;

    impl DriverProcess for Running {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn has_exited(&mut self) -> bool {
            false
        }

        fn kill(&mut self) {}
    }

    struct SocketLauncher;

    #[async_trait]
    impl DriverLauncher for SocketLauncher {
        async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn DriverProcess>> {
            let socket = spec
                .rootfs
                .join(ProxyLayout::driver_socket_in_rootfs(&spec.alias).trim_start_matches('/'));
            std::fs::write(socket, b"")?;
            Ok(Box::new(Running))
        }
    }

    /// Accepts every call; DeleteVolume fails for names in `undeletable`.
    #[derive(Default)]
    pub struct FakeDriver {
        pub calls: parking_lot::Mutex<Vec<&'static str>>,
        pub undeletable: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CsiBackend for FakeDriver {
        async fn create_volume(
            &self,
            name: &str,
            _parameters: &HashMap<String, String>,
            _secrets: &HashMap<String, String>,
        ) -> Result<CreatedVolume> {
            self.calls.lock().push("CreateVolume");
            Ok(CreatedVolume {
                volume_id: name.to_string(),
                ..Default::default()
            })
        }

        async fn delete_volume(&self, volume_id: &str, _secrets: &HashMap<String, String>) -> Result<()> {
            self.calls.lock().push("DeleteVolume");
            if self.undeletable.lock().iter().any(|name| name == volume_id) {
                return Err(ProxyError::Csi(tonic::Status::failed_precondition(
                    "volume in use",
                )));
            }
            Ok(())
        }

        async fn node_stage_volume(
            &self,
            _volume_id: &str,
            _staging_path: &Path,
            _volume_context: &HashMap<String, String>,
            _secrets: &HashMap<String, String>,
        ) -> Result<()> {
            self.calls.lock().push("NodeStageVolume");
            Ok(())
        }

        async fn node_publish_volume(
            &self,
            _volume_id: &str,
            _staging_path: &Path,
            _target_path: &Path,
            _volume_context: &HashMap<String, String>,
            _secrets: &HashMap<String, String>,
        ) -> Result<()> {
            self.calls.lock().push("NodePublishVolume");
            Ok(())
        }

        async fn node_unpublish_volume(&self, _volume_id: &str, _target_path: &Path) -> Result<()> {
            self.calls.lock().push("NodeUnpublishVolume");
            Ok(())
        }
    }

    struct Connector(Arc<FakeDriver>);

    #[async_trait]
    impl CsiConnector for Connector {
        async fn connect(&self, _endpoint: &Path) -> Result<Arc<dyn CsiBackend>> {
            Ok(self.0.clone())
        }
    }

    /// Registry rooted at `root` with one driver aliased `nfs`.
    pub fn manager(root: &Path) -> (Arc<VolumeManager>, Arc<FakeDriver>) {
        let mut config = ProxyConfig {
            root_dir: root.to_path_buf(),
            node_id: Some("node-1".to_string()),
            ..Default::default()
        };
        config.drivers.insert(
            "nfs".to_string(),
            DriverDefinition {
                alias: "nfs".to_string(),
                image: "registry.example/nfs-csi:1.0".to_string(),
                bin_path: "/nfsplugin".to_string(),
                driver_name: "nfs.csi.example".to_string(),
                ..Default::default()
            },
        );
        let config = Arc::new(config);
        let layout = ProxyLayout::new(root);
        let supervisor = DriverSupervisor::new(
            config.clone(),
            layout.clone(),
            Arc::new(Rootfs),
            Arc::new(SocketLauncher),
            Arc::new(ManualClock::new()),
        );
        let driver = Arc::new(FakeDriver::default());
        let manager = VolumeManager::new(
            config,
            layout,
            Arc::new(supervisor),
            Arc::new(Connector(driver.clone())),
        );
        (Arc::new(manager), driver)
    }
}
