//! Blob operations for registry client
//!
//! Implements Docker Registry v2 blob operations:
//! - Blob existence checks (HEAD /v2/{name}/blobs/{digest})
//! - Blob download (GET /v2/{name}/blobs/{digest})
//! - Monolithic upload (POST /v2/{name}/blobs/uploads/, then PUT ?digest=)

use crate::digest::Digest;
use crate::error::handlers::NetworkErrorHandler;
use crate::error::{RegistryError, Result};
use crate::logging::Logger;
use crate::registry::BlobStream;
use crate::registry::transport::{RegistryTransport, resolve_location};
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use std::path::Path;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

#[derive(Clone)]
pub struct BlobOperations {
    transport: Arc<RegistryTransport>,
    output: Logger,
}

impl BlobOperations {
    pub fn new(transport: Arc<RegistryTransport>, output: Logger) -> Self {
        Self { transport, output }
    }

    /// Check if blob exists using a HEAD request
    pub async fn exists(&self, repository: &str, digest: &Digest) -> Result<bool> {
        let response = self
            .transport
            .send(repository, "blob existence check", |client, base| {
                Ok(client.head(format!("{}/v2/{}/blobs/{}", base, repository, digest)))
            })
            .await?;

        match response.status() {
            status if status.is_success() => {
                self.output
                    .trace(&format!("Blob {} exists in {}", digest.short(), repository));
                Ok(true)
            }
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(self
                .transport
                .error_for(response, "blob existence check", &digest.to_string())
                .await),
        }
    }

    /// Open a streaming download of a blob. Redirects to storage backends
    /// are followed by the HTTP client.
    pub async fn pull(&self, repository: &str, digest: &Digest) -> Result<BlobStream> {
        let response = self
            .transport
            .send(repository, "blob download", |client, base| {
                Ok(client.get(format!("{}/v2/{}/blobs/{}", base, repository, digest)))
            })
            .await?;

        if !response.status().is_success() {
            return Err(self
                .transport
                .error_for(response, "blob download", &digest.to_string())
                .await);
        }

        let stream = response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| NetworkErrorHandler::handle_network_error(&e, "blob download"))
        });
        Ok(Box::pin(stream))
    }

    /// Upload the verified content at `path` as `digest`
    pub async fn push(&self, repository: &str, digest: &Digest, size: u64, path: &Path) -> Result<()> {
        self.output.detail(&format!(
            "Uploading {} ({}) to {}",
            digest.short(),
            self.output.format_size(size),
            repository
        ));

        let response = self
            .transport
            .send(repository, "blob upload session", |client, base| {
                Ok(client
                    .post(format!("{}/v2/{}/blobs/uploads/", base, repository))
                    .header(CONTENT_LENGTH, 0))
            })
            .await?;

        if response.status() != StatusCode::ACCEPTED && !response.status().is_success() {
            return Err(self
                .transport
                .error_for(response, "blob upload session", repository)
                .await);
        }

        let location = response
            .headers()
            .get(LOCATION)
            .ok_or_else(|| RegistryError::Registry {
                status: response.status().as_u16(),
                message: "Missing Location header in upload session response".to_string(),
            })?
            .to_str()
            .map_err(|e| RegistryError::Parse(format!("Invalid Location header: {}", e)))?
            .to_string();

        let base = self.transport.base_url().await?;
        let mut upload_url = resolve_location(base, &location)?;
        upload_url
            .query_pairs_mut()
            .append_pair("digest", &digest.to_string());

        let response = self
            .transport
            .send(repository, "blob upload", |client, _| {
                let file = std::fs::File::open(path)?;
                let body = reqwest::Body::wrap_stream(ReaderStream::new(tokio::fs::File::from_std(file)));
                Ok(client
                    .put(upload_url.as_str())
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .header(CONTENT_LENGTH, size)
                    .body(body))
            })
            .await?;

        if !response.status().is_success() {
            return Err(self
                .transport
                .error_for(response, "blob upload", &digest.to_string())
                .await);
        }

        self.output
            .trace(&format!("Blob {} committed to {}", digest.short(), repository));
        Ok(())
    }
}
