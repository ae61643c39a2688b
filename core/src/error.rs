use thiserror::Error;

/// CSI proxy error types
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Caller supplied an invalid request
    #[error("Usage error: {0}")]
    Usage(String),

    /// Requested driver alias is not configured
    #[error("Unknown driver alias: {0}")]
    UnknownDriver(String),

    /// Volume is not in the registry
    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    /// Driver binary could not be started
    #[error("Driver launch failed: {alias} - {message}")]
    LaunchError { alias: String, message: String },

    /// Timeout error
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// CSI driver returned an error status
    #[error("CSI error: {0}")]
    Csi(#[from] tonic::Status),

    /// Connection to a driver endpoint failed
    #[error("Transport error: {endpoint} - {message}")]
    Transport { endpoint: String, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// OCI image error
    #[error("OCI image error: {0}")]
    OciImageError(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ProxyError {
    /// Whether the error was caused by the caller's request rather than infrastructure.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            ProxyError::Usage(_)
                | ProxyError::UnknownDriver(_)
                | ProxyError::VolumeNotFound(_)
                | ProxyError::ConfigError(_)
        )
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

/// Result type alias for CSI proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;
