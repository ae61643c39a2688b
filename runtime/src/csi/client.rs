//! CSI client bound to one driver's Unix socket.
//!
//! Every request carries the same mount capability: `ext4`,
//! `SINGLE_NODE_WRITER`. Driver errors come back as `ProxyError::Csi` with
//! the driver's status untouched.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use csi_proxy_core::config::ProxyConfig;
use csi_proxy_core::error::{ProxyError, Result};
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};

use super::proto::controller_client::ControllerClient;
use super::proto::node_client::NodeClient;
use super::proto::volume_capability::access_mode::Mode;
use super::proto::volume_capability::{AccessMode, AccessType, MountVolume};
use super::proto::{
    CreateVolumeRequest, DeleteVolumeRequest, NodePublishVolumeRequest, NodeStageVolumeRequest,
    NodeUnpublishVolumeRequest, VolumeCapability,
};

/// Filesystem type requested for every volume.
pub const FS_TYPE: &str = "ext4";

/// Volume as reported by CreateVolume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreatedVolume {
    pub volume_id: String,
    pub volume_context: HashMap<String, String>,
    pub capacity_bytes: i64,
}

/// The CSI calls the volume registry makes against a driver.
#[async_trait]
pub trait CsiBackend: Send + Sync {
    async fn create_volume(
        &self,
        name: &str,
        parameters: &HashMap<String, String>,
        secrets: &HashMap<String, String>,
    ) -> Result<CreatedVolume>;

    async fn delete_volume(&self, volume_id: &str, secrets: &HashMap<String, String>) -> Result<()>;

    async fn node_stage_volume(
        &self,
        volume_id: &str,
        staging_path: &Path,
        volume_context: &HashMap<String, String>,
        secrets: &HashMap<String, String>,
    ) -> Result<()>;

    async fn node_publish_volume(
        &self,
        volume_id: &str,
        staging_path: &Path,
        target_path: &Path,
        volume_context: &HashMap<String, String>,
        secrets: &HashMap<String, String>,
    ) -> Result<()>;

    async fn node_unpublish_volume(&self, volume_id: &str, target_path: &Path) -> Result<()>;
}

/// Opens a [`CsiBackend`] for a driver socket.
#[async_trait]
pub trait CsiConnector: Send + Sync {
    async fn connect(&self, endpoint: &Path) -> Result<Arc<dyn CsiBackend>>;
}

/// Connects real gRPC clients.
#[derive(Debug, Clone, Default)]
pub struct GrpcConnector {
    timeout: Option<Duration>,
}

impl GrpcConnector {
    /// Attach `timeout` as the gRPC deadline of every call.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    /// Connector honouring the configured `csiTimeoutSecs`.
    pub fn from_config(config: &ProxyConfig) -> Self {
        match config.csi_timeout_secs {
            Some(secs) => Self::with_timeout(Duration::from_secs(secs)),
            None => Self::default(),
        }
    }
}

#[async_trait]
impl CsiConnector for GrpcConnector {
    async fn connect(&self, endpoint: &Path) -> Result<Arc<dyn CsiBackend>> {
        let mut client = CsiServiceClient::connect(endpoint).await?;
        client.timeout = self.timeout;
        Ok(Arc::new(client))
    }
}

/// gRPC client for a driver's Controller and Node services.
#[derive(Debug, Clone)]
pub struct CsiServiceClient {
    controller: ControllerClient<Channel>,
    node: NodeClient<Channel>,
    timeout: Option<Duration>,
}

impl CsiServiceClient {
    /// Connect to the driver listening on `socket_path`.
    ///
    /// The connection is established eagerly so an unreachable driver is
    /// reported here rather than on the first call.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let transport_error = |message: String| ProxyError::Transport {
            endpoint: socket_path.display().to_string(),
            message,
        };

        let path = socket_path.to_path_buf();
        // The authority is ignored; the connector always dials the socket.
        let channel = Endpoint::try_from("http://[::]:50051")
            .map_err(|e| transport_error(e.to_string()))?
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                UnixStream::connect(path.clone())
            }))
            .await
            .map_err(|e| transport_error(e.to_string()))?;

        tracing::debug!(endpoint = %socket_path.display(), "Connected to CSI driver");

        Ok(Self {
            controller: ControllerClient::new(channel.clone()),
            node: NodeClient::new(channel),
            timeout: None,
        })
    }

    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        if let Some(timeout) = self.timeout {
            request.set_timeout(timeout);
        }
        request
    }
}

/// The fixed mount capability sent with every request.
pub fn mount_capability() -> VolumeCapability {
    VolumeCapability {
        access_mode: Some(AccessMode {
            mode: Mode::SingleNodeWriter as i32,
        }),
        access_type: Some(AccessType::Mount(MountVolume {
            fs_type: FS_TYPE.to_string(),
            mount_flags: Vec::new(),
        })),
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl CsiBackend for CsiServiceClient {
    async fn create_volume(
        &self,
        name: &str,
        parameters: &HashMap<String, String>,
        secrets: &HashMap<String, String>,
    ) -> Result<CreatedVolume> {
        let request = self.request(CreateVolumeRequest {
            name: name.to_string(),
            capacity_range: None,
            volume_capabilities: vec![mount_capability()],
            parameters: parameters.clone(),
            secrets: secrets.clone(),
        });

        let response = self.controller.clone().create_volume(request).await?;
        let volume = response.into_inner().volume.unwrap_or_default();
        Ok(CreatedVolume {
            volume_id: volume.volume_id,
            volume_context: volume.volume_context,
            capacity_bytes: volume.capacity_bytes,
        })
    }

    async fn delete_volume(&self, volume_id: &str, secrets: &HashMap<String, String>) -> Result<()> {
        let request = self.request(DeleteVolumeRequest {
            volume_id: volume_id.to_string(),
            secrets: secrets.clone(),
        });
        self.controller.clone().delete_volume(request).await?;
        Ok(())
    }

    async fn node_stage_volume(
        &self,
        volume_id: &str,
        staging_path: &Path,
        volume_context: &HashMap<String, String>,
        secrets: &HashMap<String, String>,
    ) -> Result<()> {
        let request = self.request(NodeStageVolumeRequest {
            volume_id: volume_id.to_string(),
            publish_context: HashMap::new(),
            staging_target_path: path_string(staging_path),
            volume_capability: Some(mount_capability()),
            secrets: secrets.clone(),
            volume_context: volume_context.clone(),
        });
        self.node.clone().node_stage_volume(request).await?;
        Ok(())
    }

    async fn node_publish_volume(
        &self,
        volume_id: &str,
        staging_path: &Path,
        target_path: &Path,
        volume_context: &HashMap<String, String>,
        secrets: &HashMap<String, String>,
    ) -> Result<()> {
        let request = self.request(NodePublishVolumeRequest {
            volume_id: volume_id.to_string(),
            publish_context: HashMap::new(),
            staging_target_path: path_string(staging_path),
            target_path: path_string(target_path),
            volume_capability: Some(mount_capability()),
            readonly: false,
            secrets: secrets.clone(),
            volume_context: volume_context.clone(),
        });
        self.node.clone().node_publish_volume(request).await?;
        Ok(())
    }

    async fn node_unpublish_volume(&self, volume_id: &str, target_path: &Path) -> Result<()> {
        let request = self.request(NodeUnpublishVolumeRequest {
            volume_id: volume_id.to_string(),
            target_path: path_string(target_path),
        });
        self.node.clone().node_unpublish_volume(request).await?;
        Ok(())
    }
}
