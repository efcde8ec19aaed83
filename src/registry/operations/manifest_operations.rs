//! Manifest operations for registry client
//!
//! Implements Docker Registry v2 and OCI manifest operations:
//! - Manifest download (GET /v2/{name}/manifests/{reference})
//! - Digest lookup (HEAD /v2/{name}/manifests/{reference})
//! - Manifest upload (PUT /v2/{name}/manifests/{reference})

use crate::digest::Digest;
use crate::error::Result;
use crate::image::manifest::{MANIFEST_ACCEPT, RawManifest};
use crate::logging::Logger;
use crate::registry::transport::RegistryTransport;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::sync::Arc;

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

#[derive(Clone)]
pub struct ManifestOperations {
    transport: Arc<RegistryTransport>,
    output: Logger,
}

impl ManifestOperations {
    pub fn new(transport: Arc<RegistryTransport>, output: Logger) -> Self {
        Self { transport, output }
    }

    pub async fn pull(&self, repository: &str, reference: &str) -> Result<RawManifest> {
        let subject = format!("{}:{}", repository, reference);
        let response = self
            .transport
            .send(repository, "manifest download", |client, base| {
                Ok(client
                    .get(format!("{}/v2/{}/manifests/{}", base, repository, reference))
                    .header(ACCEPT, MANIFEST_ACCEPT))
            })
            .await?;

        if !response.status().is_success() {
            return Err(self
                .transport
                .error_for(response, "manifest download", &subject)
                .await);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;

        let manifest = RawManifest::from_response(content_type.as_deref(), bytes)?;
        self.output.detail(&format!(
            "Fetched {} ({}, {})",
            subject,
            manifest.media_type,
            manifest.digest.short()
        ));
        Ok(manifest)
    }

    /// Digest of the manifest at `reference`, `None` when it does not exist.
    /// Falls back to a full GET when the registry omits the digest header.
    pub async fn digest(&self, repository: &str, reference: &str) -> Result<Option<Digest>> {
        let subject = format!("{}:{}", repository, reference);
        let response = self
            .transport
            .send(repository, "manifest lookup", |client, base| {
                Ok(client
                    .head(format!("{}/v2/{}/manifests/{}", base, repository, reference))
                    .header(ACCEPT, MANIFEST_ACCEPT))
            })
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let header = response
                    .headers()
                    .get(DOCKER_CONTENT_DIGEST)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<Digest>().ok());
                match header {
                    Some(digest) => Ok(Some(digest)),
                    None => Ok(Some(self.pull(repository, reference).await?.digest)),
                }
            }
            _ => Err(self
                .transport
                .error_for(response, "manifest lookup", &subject)
                .await),
        }
    }

    /// Push `manifest` byte-for-byte under `reference`
    pub async fn push(&self, repository: &str, reference: &str, manifest: &RawManifest) -> Result<()> {
        let subject = format!("{}:{}", repository, reference);
        let response = self
            .transport
            .send(repository, "manifest upload", |client, base| {
                Ok(client
                    .put(format!("{}/v2/{}/manifests/{}", base, repository, reference))
                    .header(CONTENT_TYPE, manifest.media_type.as_str())
                    .body(manifest.bytes.clone()))
            })
            .await?;

        if !response.status().is_success() {
            return Err(self
                .transport
                .error_for(response, "manifest upload", &subject)
                .await);
        }

        self.output.detail(&format!(
            "Pushed manifest {} as {}",
            manifest.digest.short(),
            subject
        ));
        Ok(())
    }
}
