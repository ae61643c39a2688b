//! Registry client for fetching driver images.
//!
//! Uses the `oci-distribution` crate to download a driver image and write it
//! to disk as an OCI image layout, resolving multi-arch indexes to the host
//! platform.

use std::path::Path;

use csi_proxy_core::error::{ProxyError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use tokio::io::AsyncWriteExt;

use super::reference::ImageReference;

/// Credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// No credentials.
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Basic authentication.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Read `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`, anonymous if either is unset.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(u), Some(p)) => Self::basic(u, p),
            _ => Self::anonymous(),
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Downloads images from container registries.
pub struct RegistryPuller {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryPuller {
    /// Create a puller with the given credentials.
    pub fn with_auth(auth: RegistryAuth) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }

    /// Pull `reference` into `target_dir` as an OCI image layout.
    ///
    /// Returns the manifest digest.
    pub async fn pull(&self, reference: &ImageReference, target_dir: &Path) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        let registry_error = |message: String| ProxyError::RegistryError {
            registry: reference.registry.clone(),
            message,
        };

        tracing::info!(
            reference = %reference,
            target = %target_dir.display(),
            "Pulling driver image"
        );

        let blobs_dir = target_dir.join("blobs").join("sha256");
        tokio::fs::create_dir_all(&blobs_dir)
            .await
            .map_err(|e| registry_error(format!("Failed to create blobs directory: {}", e)))?;

        let (manifest, manifest_digest) = self
            .client
            .pull_image_manifest(&oci_ref, &self.auth.to_oci_auth())
            .await
            .map_err(|e| registry_error(format!("Failed to pull manifest: {}", e)))?;

        let manifest_json = serde_json::to_vec(&manifest)?;
        tokio::fs::write(blobs_dir.join(digest_hex(&manifest_digest)), &manifest_json)
            .await
            .map_err(|e| registry_error(format!("Failed to write manifest: {}", e)))?;

        for descriptor in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            self.pull_blob(&oci_ref, descriptor, &blobs_dir)
                .await
                .map_err(|e| registry_error(format!("Failed to pull blob {}: {}", descriptor.digest, e)))?;
        }

        tokio::fs::write(
            target_dir.join("oci-layout"),
            r#"{"imageLayoutVersion":"1.0.0"}"#,
        )
        .await
        .map_err(|e| registry_error(format!("Failed to write oci-layout: {}", e)))?;

        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": manifest_digest,
                "size": manifest_json.len()
            }]
        });
        tokio::fs::write(
            target_dir.join("index.json"),
            serde_json::to_string_pretty(&index)?,
        )
        .await
        .map_err(|e| registry_error(format!("Failed to write index.json: {}", e)))?;

        tracing::info!(
            reference = %reference,
            digest = %manifest_digest,
            layers = manifest.layers.len(),
            "Driver image pulled"
        );

        Ok(manifest_digest)
    }

    /// Stream one blob to `blobs_dir/<hex>`.
    async fn pull_blob(
        &self,
        oci_ref: &Reference,
        descriptor: &OciDescriptor,
        blobs_dir: &Path,
    ) -> std::result::Result<(), String> {
        tracing::debug!(digest = %descriptor.digest, size = descriptor.size, "Pulling blob");

        let path = blobs_dir.join(digest_hex(&descriptor.digest));
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| e.to_string())?;
        self.client
            .pull_blob(oci_ref, descriptor, &mut file)
            .await
            .map_err(|e| e.to_string())?;
        file.flush().await.map_err(|e| e.to_string())
    }
}

fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = match (&reference.digest, &reference.tag) {
        (Some(digest), _) => format!("{}/{}@{}", reference.registry, reference.repository, digest),
        (None, Some(tag)) => format!("{}/{}:{}", reference.registry, reference.repository, tag),
        (None, None) => format!("{}/{}:latest", reference.registry, reference.repository),
    };
    ref_str.parse::<Reference>().map_err(|e| {
        ProxyError::OciImageError(format!("Invalid OCI reference '{}': {}", ref_str, e))
    })
}

/// Pick the manifest matching the host's Linux architecture.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_variants() {
        assert!(matches!(
            RegistryAuth::anonymous().to_oci_auth(),
            OciRegistryAuth::Anonymous
        ));
        assert!(matches!(
            RegistryAuth::basic("u", "p").to_oci_auth(),
            OciRegistryAuth::Basic(_, _)
        ));
    }

    #[test]
    fn test_digest_hex() {
        assert_eq!(digest_hex("sha256:abc"), "abc");
        assert_eq!(digest_hex("abc"), "abc");
    }

    #[test]
    fn test_to_oci_reference_prefers_digest() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let r = ImageReference::parse(&format!("ghcr.io/org/driver:1.0@{}", digest)).unwrap();
        let oci = to_oci_reference(&r).unwrap();
        assert_eq!(oci.digest(), Some(digest.as_str()));
    }

    #[test]
    fn test_to_oci_reference_tag() {
        let r = ImageReference::parse("registry.k8s.io/sig-storage/nfsplugin:v4.6.0").unwrap();
        let oci = to_oci_reference(&r).unwrap();
        assert_eq!(oci.registry(), "registry.k8s.io");
        assert_eq!(oci.repository(), "sig-storage/nfsplugin");
        assert_eq!(oci.tag(), Some("v4.6.0"));
    }
}
