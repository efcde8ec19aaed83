//! Validated settings for one copy invocation

use crate::copy::orchestrator::{CopyOptions, DEFAULT_RETRIES, default_concurrency};
use crate::error::{RegistryError, Result};
use crate::image::platform::PlatformSpec;
use crate::logging::LogLevel;
use crate::registry::credentials::ExplicitCredential;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct CopyConfig {
    pub source: String,
    pub destination: String,
    pub source_credential: ExplicitCredential,
    pub destination_credential: ExplicitCredential,
    pub platform: String,
    pub no_clobber: bool,
    pub overwrite: bool,
    pub insecure: bool,
    pub jobs: usize,
    pub retries: u32,
    pub timeout: Duration,
    /// Persist explicit credentials to the Docker config before copying
    pub login: bool,
    pub log_level: LogLevel,
    pub card_path: Option<PathBuf>,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            source: String::new(),
            destination: String::new(),
            source_credential: ExplicitCredential::default(),
            destination_credential: ExplicitCredential::default(),
            platform: "all".to_string(),
            no_clobber: false,
            overwrite: false,
            insecure: false,
            jobs: default_concurrency(),
            retries: DEFAULT_RETRIES,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            login: false,
            log_level: LogLevel::Info,
            card_path: None,
        }
    }
}

impl CopyConfig {
    /// Reject unusable settings before any network access
    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(RegistryError::Configuration(
                "source image reference is required".to_string(),
            ));
        }
        if self.destination.trim().is_empty() {
            return Err(RegistryError::Configuration(
                "destination image reference is required".to_string(),
            ));
        }
        if self.no_clobber && self.overwrite {
            return Err(RegistryError::Configuration(
                "no-clobber and overwrite are mutually exclusive".to_string(),
            ));
        }
        if self.jobs == 0 {
            return Err(RegistryError::Configuration(
                "jobs must be greater than 0".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(RegistryError::Configuration(
                "timeout must be greater than 0".to_string(),
            ));
        }
        if self.login
            && self.source_credential.is_empty()
            && self.destination_credential.is_empty()
        {
            return Err(RegistryError::Configuration(
                "login requested but no credentials were given".to_string(),
            ));
        }
        self.platform_spec()?;
        Ok(())
    }

    pub fn platform_spec(&self) -> Result<PlatformSpec> {
        self.platform.parse()
    }

    pub fn copy_options(&self) -> Result<CopyOptions> {
        Ok(CopyOptions {
            platform: self.platform_spec()?,
            concurrency: self.jobs,
            overwrite: self.overwrite,
            no_clobber: self.no_clobber,
            retries: self.retries,
            ..CopyOptions::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CopyConfig {
        CopyConfig {
            source: "src.example.com/app:v1".into(),
            destination: "dst.example.com/app:v1".into(),
            ..CopyConfig::default()
        }
    }

    #[test]
    fn test_valid_config() {
        let config = config();
        config.validate().unwrap();
        let options = config.copy_options().unwrap();
        assert!(options.platform.is_all());
        assert!(options.concurrency >= 1);
        assert_eq!(options.retries, DEFAULT_RETRIES);
    }

    #[test]
    fn test_missing_references() {
        let mut missing_src = config();
        missing_src.source = "  ".into();
        assert!(matches!(
            missing_src.validate(),
            Err(RegistryError::Configuration(_))
        ));

        let mut missing_dst = config();
        missing_dst.destination = String::new();
        assert!(matches!(
            missing_dst.validate(),
            Err(RegistryError::Configuration(_))
        ));
    }

    #[test]
    fn test_conflicting_and_zero_values() {
        let mut both = config();
        both.no_clobber = true;
        both.overwrite = true;
        assert!(both.validate().is_err());

        let mut zero_jobs = config();
        zero_jobs.jobs = 0;
        assert!(zero_jobs.validate().is_err());

        let mut zero_timeout = config();
        zero_timeout.timeout = Duration::ZERO;
        assert!(zero_timeout.validate().is_err());

        let mut bad_platform = config();
        bad_platform.platform = "linux".into();
        assert!(bad_platform.validate().is_err());

        let mut empty_login = config();
        empty_login.login = true;
        assert!(empty_login.validate().is_err());
    }
}
