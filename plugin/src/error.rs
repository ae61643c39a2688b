//! Plugin-protocol error conversions.

use csi_proxy_core::error::ProxyError;
use hyper::StatusCode;
use thiserror::Error;

/// Failure answering one plugin request.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("method {0} not allowed")]
    MethodNotAllowed(String),

    #[error("malformed request body: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Proxy(#[from] ProxyError),
}

impl PluginError {
    /// HTTP status carried with the `{"Err": ...}` body.
    pub fn status(&self) -> StatusCode {
        match self {
            PluginError::UnknownEndpoint(_) => StatusCode::NOT_FOUND,
            PluginError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            PluginError::BadRequest(_) => StatusCode::BAD_REQUEST,
            PluginError::Proxy(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        PluginError::BadRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_errors_map_to_internal() {
        let err = PluginError::from(ProxyError::VolumeNotFound("data".to_string()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "Volume not found: data");
    }

    #[test]
    fn test_csi_status_message_passes_through() {
        let err = PluginError::from(ProxyError::Csi(tonic::Status::internal("share not exported")));
        assert!(err.to_string().contains("share not exported"));
    }

    #[test]
    fn test_bad_json_is_bad_request() {
        let err: PluginError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_unknown_endpoint_is_not_found() {
        let err = PluginError::UnknownEndpoint("/VolumeDriver.Resize".to_string());
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
