//! Registry access
//!
//! Every byte that moves between registries goes through the [`Registry`]
//! trait. [`RegistryClient`] speaks the OCI distribution API over HTTP;
//! [`MemoryRegistry`] keeps everything in process for tests.

pub mod auth;
pub mod client;
pub mod credentials;
pub mod memory;
pub mod operations;
pub mod token_manager;
pub mod transport;

use crate::digest::Digest;
use crate::error::Result;
use crate::image::manifest::RawManifest;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::path::Path;
use std::pin::Pin;

pub use client::{PULL_ACTIONS, PUSH_ACTIONS, RegistryClient, RegistryClientBuilder};
pub use credentials::{
    Credential, CredentialResolver, CredentialStore, DockerConfigStore, ExplicitCredential,
    MemoryCredentialStore, Mechanism,
};
pub use memory::MemoryRegistry;

/// Blob content as it arrives from a registry
pub type BlobStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Operations the copy engine needs from a registry
#[async_trait]
pub trait Registry: Send + Sync {
    /// Host this registry is reached at, e.g. `registry.example.com:5000`
    fn host(&self) -> &str;

    /// Fetch a manifest by tag or digest, returning its exact bytes
    async fn get_manifest(&self, repository: &str, reference: &str) -> Result<RawManifest>;

    /// Digest currently stored under `reference`, `None` if absent
    async fn manifest_digest(&self, repository: &str, reference: &str) -> Result<Option<Digest>>;

    async fn put_manifest(&self, repository: &str, reference: &str, manifest: &RawManifest) -> Result<()>;

    async fn blob_exists(&self, repository: &str, digest: &Digest) -> Result<bool>;

    async fn get_blob(&self, repository: &str, digest: &Digest) -> Result<BlobStream>;

    /// Upload `size` bytes read from `content` as blob `digest`
    async fn put_blob(&self, repository: &str, digest: &Digest, size: u64, content: &Path) -> Result<()>;
}
