//! HTTP server for the volume-plugin protocol.
//!
//! Listens on a Unix domain socket; each connection is served on its own task.

use std::convert::Infallible;
use std::future::Future;
use std::path::{Path, PathBuf};

use hyper::server::conn::Http;
use hyper::service::service_fn;
use tokio::net::UnixListener;

use crate::handler::PluginHandler;

/// Volume-plugin server configuration.
pub struct PluginServer {
    /// Path to the Unix domain socket.
    socket_path: PathBuf,
    handler: PluginHandler,
}

impl PluginServer {
    pub fn new(socket_path: PathBuf, handler: PluginHandler) -> Self {
        Self {
            socket_path,
            handler,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serve until `shutdown` completes, then remove the socket.
    pub async fn serve_until<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error>>
    where
        F: Future<Output = ()>,
    {
        // Remove existing socket file if present
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!(
            socket = %self.socket_path.display(),
            "Volume plugin listening"
        );

        tokio::pin!(shutdown);
        let result = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => break Err(e),
                    };
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let handler = handler.clone();
                            async move { Ok::<_, Infallible>(handler.handle(req).await) }
                        });
                        if let Err(e) = Http::new().serve_connection(stream, service).await {
                            tracing::warn!(error = %e, "Plugin connection failed");
                        }
                    });
                }
                _ = &mut shutdown => break Ok(()),
            }
        };

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            tracing::debug!(error = %e, "Socket already gone");
        }
        tracing::info!("Volume plugin stopped");
        Ok(result?)
    }
}
