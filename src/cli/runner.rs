//! Runs one copy from validated configuration

use crate::config::CopyConfig;
use crate::copy::orchestrator::CopyOrchestrator;
use crate::copy::report::CopyReport;
use crate::error::{RegistryError, Result};
use crate::image::reference::ImageReference;
use crate::logging::Logger;
use crate::output::{CardWriter, CopySummary};
use crate::registry::credentials::{
    CredentialResolver, CredentialStore, DockerConfigStore, ExplicitCredential,
    MemoryCredentialStore,
};
use crate::registry::{PULL_ACTIONS, PUSH_ACTIONS, Registry, RegistryClient};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct Runner {
    config: CopyConfig,
    output: Logger,
    keychain: Arc<MemoryCredentialStore>,
    docker_config: Option<Arc<DockerConfigStore>>,
}

impl Runner {
    pub fn new(config: CopyConfig) -> Self {
        let output = Logger::new(config.log_level);
        Self {
            config,
            output,
            keychain: Arc::new(MemoryCredentialStore::default()),
            docker_config: DockerConfigStore::from_env().map(Arc::new),
        }
    }

    /// Use `store` instead of the Docker config found via the environment
    pub fn with_docker_config(mut self, store: Option<DockerConfigStore>) -> Self {
        self.docker_config = store.map(Arc::new);
        self
    }

    pub fn logger(&self) -> &Logger {
        &self.output
    }

    fn resolver(&self) -> CredentialResolver {
        let mut stores: Vec<Arc<dyn CredentialStore>> = vec![self.keychain.clone()];
        if let Some(docker_config) = &self.docker_config {
            stores.push(docker_config.clone());
        }
        CredentialResolver::new(stores, self.output.clone())
    }

    /// Validate, resolve credentials and copy. Writes the result card on
    /// success when a card path is configured.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<CopyReport> {
        self.config.validate()?;
        let src = ImageReference::parse(&self.config.source)?;
        let dst = ImageReference::parse(&self.config.destination)?;
        let options = self.config.copy_options()?;

        self.output.section("Docker Image Copier");
        self.output.info(&format!("Source: {}", src));
        self.output.info(&format!("Destination: {}", dst));
        self.output.info(&format!("Platform: {}", options.platform));

        let resolver = self.resolver();
        if self.config.login {
            self.login(&resolver, &src, &dst)?;
        }

        let source = self.client(&resolver, &src, &self.config.source_credential, PULL_ACTIONS)?;
        let destination =
            self.client(&resolver, &dst, &self.config.destination_credential, PUSH_ACTIONS)?;

        let orchestrator = CopyOrchestrator::new(source, destination, options, self.output.clone());
        let report = orchestrator.copy(&src, &dst, cancel).await?;

        if let Some(path) = &self.config.card_path {
            CardWriter::new(path).write(&CopySummary::from(&report))?;
        }
        Ok(report)
    }

    fn login(&self, resolver: &CredentialResolver, src: &ImageReference, dst: &ImageReference) -> Result<()> {
        let store = self.docker_config.as_ref().ok_or_else(|| {
            RegistryError::Configuration(
                "login requested but neither DOCKER_CONFIG nor HOME is set".to_string(),
            )
        })?;
        self.output.detail(&format!("Logging in via {}", store.path().display()));

        for (reference, explicit) in [
            (src, &self.config.source_credential),
            (dst, &self.config.destination_credential),
        ] {
            if !explicit.is_empty() {
                resolver.login(&reference.registry, explicit, store.as_ref())?;
            }
        }
        Ok(())
    }

    fn client(
        &self,
        resolver: &CredentialResolver,
        reference: &ImageReference,
        explicit: &ExplicitCredential,
        actions: &str,
    ) -> Result<Arc<dyn Registry>> {
        let credential = resolver.resolve(&reference.registry, explicit)?;
        let client = RegistryClient::builder(&reference.registry)
            .with_credential(credential)
            .with_insecure(self.config.insecure)
            .with_timeout(self.config.timeout)
            .with_actions(actions)
            .with_output(self.output.clone())
            .build()?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogLevel;

    fn config() -> CopyConfig {
        CopyConfig {
            source: "src.example.com/app:v1".into(),
            destination: "dst.example.com/app:v1".into(),
            log_level: LogLevel::Error,
            ..CopyConfig::default()
        }
    }

    #[tokio::test]
    async fn test_configuration_errors_before_network() {
        let mut missing = config();
        missing.destination = String::new();
        let err = Runner::new(missing)
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Configuration(_)));

        let mut bad_reference = config();
        bad_reference.source = "src.example.com/App:v1".into();
        let err = Runner::new(bad_reference)
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidReference { .. }));
    }

    #[tokio::test]
    async fn test_half_credentials_fail_resolution() {
        let mut half = config();
        half.destination_credential = ExplicitCredential::new(Some("ci-bot".into()), None);
        let err = Runner::new(half)
            .with_docker_config(None)
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AuthResolution { .. }));
    }

    #[test]
    fn test_login_writes_docker_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut login = config();
        login.login = true;
        login.source_credential =
            ExplicitCredential::new(Some("reader".into()), Some("pw".into()));

        let runner = Runner::new(login).with_docker_config(Some(DockerConfigStore::new(&path)));
        let src = ImageReference::parse("src.example.com/app:v1").unwrap();
        let dst = ImageReference::parse("dst.example.com/app:v1").unwrap();
        runner.login(&runner.resolver(), &src, &dst).unwrap();

        let store = DockerConfigStore::new(&path);
        assert_eq!(
            store.get("src.example.com").unwrap(),
            Some(("reader".into(), "pw".into()))
        );
        assert_eq!(store.get("dst.example.com").unwrap(), None);
    }

    #[test]
    fn test_login_without_store_is_configuration_error() {
        let mut login = config();
        login.login = true;
        login.source_credential =
            ExplicitCredential::new(Some("reader".into()), Some("pw".into()));
        let runner = Runner::new(login).with_docker_config(None);
        let src = ImageReference::parse("src.example.com/app:v1").unwrap();
        let err = runner.login(&runner.resolver(), &src, &src).unwrap_err();
        assert!(matches!(err, RegistryError::Configuration(_)));
    }
}
