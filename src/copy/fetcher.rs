//! Manifest and config retrieval with digest verification

use crate::error::{RegistryError, Result};
use crate::image::manifest::{Descriptor, Manifest, Platform, RawManifest};
use crate::image::reference::ImageReference;
use crate::logging::Logger;
use crate::registry::Registry;
use futures::StreamExt;
use std::sync::Arc;

/// Upper bound on the buffer reserved up front for an image config
const CONFIG_PREALLOC_LIMIT: u64 = 1024 * 1024;

/// Raw bytes of a manifest together with their parsed form
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub reference: ImageReference,
    pub raw: RawManifest,
    pub manifest: Manifest,
}

pub struct ManifestFetcher {
    registry: Arc<dyn Registry>,
    output: Logger,
}

impl ManifestFetcher {
    pub fn new(registry: Arc<dyn Registry>, output: Logger) -> Self {
        Self { registry, output }
    }

    /// Fetch the manifest `reference` points at.
    ///
    /// A digest-pinned reference must resolve to exactly those bytes.
    pub async fn fetch(&self, reference: &ImageReference) -> Result<FetchedManifest> {
        self.output.detail(&format!("Fetching manifest {}", reference));
        let raw = self
            .registry
            .get_manifest(&reference.repository, reference.reference())
            .await?;

        if let Some(pinned) = reference.digest() {
            pinned.verify(&raw.bytes, &format!("manifest {}", reference))?;
        }

        let manifest = raw.parse()?;
        Ok(FetchedManifest {
            reference: reference.clone(),
            raw,
            manifest,
        })
    }

    /// Fetch a manifest-list entry by its digest
    pub async fn fetch_child(
        &self,
        parent: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<FetchedManifest> {
        self.fetch(&parent.with_digest(&descriptor.digest)).await
    }

    /// Download an image config and read the platform it was built for
    pub async fn fetch_config(&self, repository: &str, descriptor: &Descriptor) -> Result<Platform> {
        let size_mismatch = |actual: usize| RegistryError::SizeMismatch {
            digest: descriptor.digest.to_string(),
            expected: descriptor.size,
            actual: actual as u64,
        };

        let mut stream = self.registry.get_blob(repository, &descriptor.digest).await?;
        let capacity = descriptor.size.min(CONFIG_PREALLOC_LIMIT) as usize;
        let mut data = Vec::with_capacity(capacity);
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk?);
            if data.len() as u64 > descriptor.size {
                return Err(size_mismatch(data.len()));
            }
        }
        if data.len() as u64 != descriptor.size {
            return Err(size_mismatch(data.len()));
        }

        descriptor.digest.verify(
            &data,
            &format!("config {}/{}", self.registry.host(), repository),
        )?;

        let platform: Platform = serde_json::from_slice(&data).map_err(|e| {
            RegistryError::Parse(format!(
                "Image config {} has no usable platform: {}",
                descriptor.digest.short(),
                e
            ))
        })?;
        Ok(platform)
    }
}
