//! In-process registry used for hermetic tests
//!
//! Behaves like a distribution registry for the operations the copier
//! needs, counts the requests it serves and can inject faults.

use crate::digest::Digest;
use crate::error::{RegistryError, Result};
use crate::image::manifest::{Descriptor, RawManifest};
use crate::registry::{BlobStream, Registry};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const CHUNK_SIZE: usize = 16;

#[derive(Default)]
struct Store {
    manifests: HashMap<String, HashMap<String, RawManifest>>,
    blobs: HashMap<String, HashMap<Digest, Bytes>>,
}

#[derive(Default)]
struct Faults {
    /// digest -> (bytes served before the stream breaks, remaining failures)
    broken_streams: HashMap<Digest, (usize, usize)>,
    corrupted: HashMap<Digest, Bytes>,
    latency: Option<Duration>,
}

/// Request counters, all monotonically increasing
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RequestCounts {
    pub blob_heads: usize,
    pub blob_gets: usize,
    pub blob_uploads: usize,
    pub manifest_gets: usize,
    pub manifest_puts: usize,
}

#[derive(Default)]
pub struct MemoryRegistry {
    host: String,
    store: Mutex<Store>,
    faults: Mutex<Faults>,
    counts: Mutex<RequestCounts>,
    uploads_in_flight: AtomicUsize,
    max_uploads_in_flight: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            ..Default::default()
        }
    }

    /// Store `content` as a blob of `repository` and describe it
    pub fn insert_blob(&self, repository: &str, media_type: &str, content: impl Into<Bytes>) -> Descriptor {
        let content = content.into();
        let descriptor = Descriptor::new(media_type, Digest::sha256(&content), content.len() as u64);
        self.with_store(|store| {
            store
                .blobs
                .entry(repository.to_string())
                .or_default()
                .insert(descriptor.digest.clone(), content);
        });
        descriptor
    }

    /// Store `manifest` under `reference` and under its own digest
    pub fn insert_manifest(&self, repository: &str, reference: &str, manifest: &RawManifest) {
        self.with_store(|store| {
            let manifests = store.manifests.entry(repository.to_string()).or_default();
            manifests.insert(reference.to_string(), manifest.clone());
            manifests.insert(manifest.digest.to_string(), manifest.clone());
        });
    }

    pub fn manifest(&self, repository: &str, reference: &str) -> Option<RawManifest> {
        self.with_store(|store| {
            store
                .manifests
                .get(repository)
                .and_then(|m| m.get(reference))
                .cloned()
        })
    }

    pub fn has_blob(&self, repository: &str, digest: &Digest) -> bool {
        self.with_store(|store| {
            store
                .blobs
                .get(repository)
                .is_some_and(|b| b.contains_key(digest))
        })
    }

    pub fn blob_count(&self, repository: &str) -> usize {
        self.with_store(|store| store.blobs.get(repository).map_or(0, HashMap::len))
    }

    pub fn counts(&self) -> RequestCounts {
        self.counts.lock().map(|c| *c).unwrap_or_default()
    }

    pub fn max_uploads_in_flight(&self) -> usize {
        self.max_uploads_in_flight.load(Ordering::SeqCst)
    }

    /// Break the next `times` downloads of `digest` after `after_bytes` bytes
    pub fn break_stream(&self, digest: &Digest, after_bytes: usize, times: usize) {
        self.with_faults(|faults| {
            faults
                .broken_streams
                .insert(digest.clone(), (after_bytes, times));
        });
    }

    /// Serve `content` instead of the stored bytes for `digest`
    pub fn corrupt_blob(&self, digest: &Digest, content: impl Into<Bytes>) {
        let content = content.into();
        self.with_faults(|faults| {
            faults.corrupted.insert(digest.clone(), content);
        });
    }

    /// Delay every blob upload, widening the window for concurrent uploads
    pub fn set_latency(&self, latency: Duration) {
        self.with_faults(|faults| faults.latency = Some(latency));
    }

    fn with_store<T>(&self, f: impl FnOnce(&mut Store) -> T) -> T {
        let mut guard = self.store.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn with_faults<T>(&self, f: impl FnOnce(&mut Faults) -> T) -> T {
        let mut guard = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn count(&self, f: impl FnOnce(&mut RequestCounts)) {
        let mut guard = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

fn chunked(content: Bytes) -> Vec<Result<Bytes>> {
    (0..content.len())
        .step_by(CHUNK_SIZE)
        .map(|start| Ok(content.slice(start..(start + CHUNK_SIZE).min(content.len()))))
        .collect()
}

#[async_trait]
impl Registry for MemoryRegistry {
    fn host(&self) -> &str {
        &self.host
    }

    async fn get_manifest(&self, repository: &str, reference: &str) -> Result<RawManifest> {
        self.count(|c| c.manifest_gets += 1);
        self.manifest(repository, reference)
            .ok_or_else(|| RegistryError::NotFound(format!("{}/{}:{}", self.host, repository, reference)))
    }

    async fn manifest_digest(&self, repository: &str, reference: &str) -> Result<Option<Digest>> {
        Ok(self.manifest(repository, reference).map(|m| m.digest))
    }

    async fn put_manifest(&self, repository: &str, reference: &str, manifest: &RawManifest) -> Result<()> {
        self.count(|c| c.manifest_puts += 1);
        if let Ok(pinned) = reference.parse::<Digest>() {
            if pinned != manifest.digest {
                return Err(RegistryError::Registry {
                    status: 400,
                    message: format!("manifest digest {} does not match {}", manifest.digest, pinned),
                });
            }
        }
        self.insert_manifest(repository, reference, manifest);
        Ok(())
    }

    async fn blob_exists(&self, repository: &str, digest: &Digest) -> Result<bool> {
        self.count(|c| c.blob_heads += 1);
        Ok(self.has_blob(repository, digest))
    }

    async fn get_blob(&self, repository: &str, digest: &Digest) -> Result<BlobStream> {
        self.count(|c| c.blob_gets += 1);
        let stored = self
            .with_store(|store| store.blobs.get(repository).and_then(|b| b.get(digest)).cloned())
            .ok_or_else(|| RegistryError::NotFound(format!("{}/{}@{}", self.host, repository, digest)))?;

        let (content, broken_after) = self.with_faults(|faults| {
            let content = faults.corrupted.get(digest).cloned().unwrap_or(stored);
            let broken_after = match faults.broken_streams.get_mut(digest) {
                Some((after, remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*after)
                }
                _ => None,
            };
            (content, broken_after)
        });

        let items = match broken_after {
            Some(after) => {
                let mut items = chunked(content.slice(..after.min(content.len())));
                items.push(Err(RegistryError::Network(format!(
                    "connection reset while reading {}",
                    digest
                ))));
                items
            }
            None => chunked(content),
        };
        Ok(Box::pin(futures::stream::iter(items)))
    }

    async fn put_blob(&self, repository: &str, digest: &Digest, size: u64, content: &Path) -> Result<()> {
        self.count(|c| c.blob_uploads += 1);
        let in_flight = self.uploads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_uploads_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let latency = self.with_faults(|faults| faults.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let result: Result<()> = async {
            let data = tokio::fs::read(content).await?;
            if data.len() as u64 != size || Digest::sha256(&data) != *digest {
                return Err(RegistryError::Registry {
                    status: 400,
                    message: format!("DIGEST_INVALID: uploaded content does not match {}", digest),
                });
            }
            self.with_store(|store| {
                store
                    .blobs
                    .entry(repository.to_string())
                    .or_default()
                    .insert(digest.clone(), Bytes::from(data));
            });
            Ok(())
        }
        .await;

        self.uploads_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn collect(stream: BlobStream) -> (Vec<u8>, Option<RegistryError>) {
        let mut data = Vec::new();
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(e) => return (data, Some(e)),
            }
        }
        (data, None)
    }

    #[tokio::test]
    async fn test_blob_round_trip_and_counts() {
        let registry = MemoryRegistry::new("src.example.com");
        let descriptor = registry.insert_blob("app", "application/octet-stream", vec![7u8; 40]);

        assert!(registry.blob_exists("app", &descriptor.digest).await.unwrap());
        assert!(!registry.blob_exists("other", &descriptor.digest).await.unwrap());

        let (data, error) = collect(registry.get_blob("app", &descriptor.digest).await.unwrap()).await;
        assert!(error.is_none());
        assert_eq!(data, vec![7u8; 40]);
        assert_eq!(registry.counts().blob_heads, 2);
        assert_eq!(registry.counts().blob_gets, 1);
    }

    #[tokio::test]
    async fn test_broken_stream_fails_after_offset_once() {
        let registry = MemoryRegistry::new("src.example.com");
        let descriptor = registry.insert_blob("app", "application/octet-stream", vec![1u8; 64]);
        registry.break_stream(&descriptor.digest, 20, 1);

        let (data, error) = collect(registry.get_blob("app", &descriptor.digest).await.unwrap()).await;
        assert_eq!(data.len(), 20);
        assert!(matches!(error, Some(RegistryError::Network(_))));

        let (data, error) = collect(registry.get_blob("app", &descriptor.digest).await.unwrap()).await;
        assert_eq!(data.len(), 64);
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_put_blob_rejects_wrong_content() {
        let registry = MemoryRegistry::new("dst.example.com");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"actual").unwrap();

        let err = registry
            .put_blob("app", &Digest::sha256(b"expected"), 6, &path)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Registry { status: 400, .. }));
        assert_eq!(registry.blob_count("app"), 0);

        registry
            .put_blob("app", &Digest::sha256(b"actual"), 6, &path)
            .await
            .unwrap();
        assert!(registry.has_blob("app", &Digest::sha256(b"actual")));
    }

    #[tokio::test]
    async fn test_manifest_by_tag_and_digest() {
        let registry = MemoryRegistry::new("dst.example.com");
        let manifest = RawManifest::new(
            crate::image::manifest::media_types::OCI_MANIFEST,
            br#"{"schemaVersion":2}"#.to_vec(),
        );
        registry.put_manifest("app", "v1", &manifest).await.unwrap();

        assert_eq!(
            registry.manifest_digest("app", "v1").await.unwrap(),
            Some(manifest.digest.clone())
        );
        let by_digest = registry
            .get_manifest("app", &manifest.digest.to_string())
            .await
            .unwrap();
        assert_eq!(by_digest.bytes, manifest.bytes);
        assert!(matches!(
            registry.get_manifest("app", "v2").await,
            Err(RegistryError::NotFound(_))
        ));

        let wrong = Digest::sha256(b"other").to_string();
        assert!(registry.put_manifest("app", &wrong, &manifest).await.is_err());
    }
}
