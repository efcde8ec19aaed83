//! HTTP implementation of [`Registry`] over the OCI distribution API

use crate::digest::Digest;
use crate::error::{RegistryError, Result};
use crate::image::manifest::RawManifest;
use crate::logging::Logger;
use crate::registry::auth::Auth;
use crate::registry::credentials::Credential;
use crate::registry::operations::{BlobOperations, ManifestOperations};
use crate::registry::token_manager::TokenManager;
use crate::registry::transport::RegistryTransport;
use crate::registry::{BlobStream, Registry};
use async_trait::async_trait;
use reqwest::Client;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const PULL_ACTIONS: &str = "pull";
pub const PUSH_ACTIONS: &str = "pull,push";

pub struct RegistryClientBuilder {
    host: String,
    credential: Credential,
    insecure: bool,
    timeout: Duration,
    actions: String,
    output: Logger,
}

impl RegistryClientBuilder {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            credential: Credential::anonymous(host),
            insecure: false,
            timeout: Duration::from_secs(300),
            actions: PULL_ACTIONS.to_string(),
            output: Logger::default(),
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Token scope actions, `pull` for sources and `pull,push` for
    /// destinations
    pub fn with_actions(mut self, actions: &str) -> Self {
        self.actions = actions.to_string();
        self
    }

    pub fn with_output(mut self, output: Logger) -> Self {
        self.output = output;
        self
    }

    pub fn build(self) -> Result<RegistryClient> {
        if self.credential.registry_host != self.host {
            return Err(RegistryError::AuthResolution {
                registry: self.host.clone(),
                reason: format!(
                    "credential belongs to {}",
                    self.credential.registry_host
                ),
            });
        }

        // The timeout bounds connection setup and idle reads; large blob
        // bodies may take longer overall
        let mut builder = Client::builder()
            .connect_timeout(self.timeout)
            .read_timeout(self.timeout)
            .user_agent(concat!("docker-image-copier/", env!("CARGO_PKG_VERSION")));
        if self.insecure {
            self.output
                .warning(&format!("TLS verification disabled for {}", self.host));
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        let client = builder
            .build()
            .map_err(|e| RegistryError::Network(format!("Failed to build HTTP client: {}", e)))?;

        let auth = Auth::new(client.clone(), self.credential, self.output.clone());
        let tokens = TokenManager::new(auth, &self.actions, self.output.clone());
        let transport = Arc::new(RegistryTransport::new(
            client,
            &self.host,
            self.insecure,
            tokens,
            self.output.clone(),
        ));

        Ok(RegistryClient {
            blobs: BlobOperations::new(transport.clone(), self.output.clone()),
            manifests: ManifestOperations::new(transport.clone(), self.output),
            transport,
        })
    }
}

pub struct RegistryClient {
    transport: Arc<RegistryTransport>,
    blobs: BlobOperations,
    manifests: ManifestOperations,
}

impl RegistryClient {
    pub fn builder(host: &str) -> RegistryClientBuilder {
        RegistryClientBuilder::new(host)
    }
}

#[async_trait]
impl Registry for RegistryClient {
    fn host(&self) -> &str {
        self.transport.host()
    }

    async fn get_manifest(&self, repository: &str, reference: &str) -> Result<RawManifest> {
        self.manifests.pull(repository, reference).await
    }

    async fn manifest_digest(&self, repository: &str, reference: &str) -> Result<Option<Digest>> {
        self.manifests.digest(repository, reference).await
    }

    async fn put_manifest(&self, repository: &str, reference: &str, manifest: &RawManifest) -> Result<()> {
        self.manifests.push(repository, reference, manifest).await
    }

    async fn blob_exists(&self, repository: &str, digest: &Digest) -> Result<bool> {
        self.blobs.exists(repository, digest).await
    }

    async fn get_blob(&self, repository: &str, digest: &Digest) -> Result<BlobStream> {
        self.blobs.pull(repository, digest).await
    }

    async fn put_blob(&self, repository: &str, digest: &Digest, size: u64, content: &Path) -> Result<()> {
        self.blobs.push(repository, digest, size, content).await
    }
}
