//! Command-line argument parsing

use crate::config::{CopyConfig, DEFAULT_TIMEOUT_SECS};
use crate::copy::orchestrator::{DEFAULT_RETRIES, default_concurrency};
use crate::error::{RegistryError, Result};
use crate::logging::LogLevel;
use crate::registry::credentials::ExplicitCredential;
use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Parser, Debug, Default)]
#[command(name = "docker-image-copier")]
#[command(about = "Copy container images between OCI registries")]
#[command(version)]
pub struct Args {
    /// Source image reference
    #[arg(long = "src", help = "Source image, e.g. registry.example.com/app:v1")]
    pub src: Option<String>,

    /// Destination image reference
    #[arg(long = "dst", help = "Destination image, e.g. mirror.example.com/app:v1")]
    pub dst: Option<String>,

    #[arg(long = "src-user", help = "Username for the source registry")]
    pub src_user: Option<String>,

    #[arg(long = "src-pass", help = "Password or token for the source registry")]
    pub src_pass: Option<String>,

    #[arg(long = "dst-user", help = "Username for the destination registry")]
    pub dst_user: Option<String>,

    #[arg(long = "dst-pass", help = "Password or token for the destination registry")]
    pub dst_pass: Option<String>,

    #[arg(
        long = "platform",
        help = "Platform to copy: all, or os/arch[/variant][:osversion]"
    )]
    pub platform: Option<String>,

    #[arg(
        long = "no-clobber",
        help = "Fail if the destination tag exists with different content"
    )]
    pub no_clobber: bool,

    #[arg(long = "overwrite", help = "Upload blobs even if the destination has them")]
    pub overwrite: bool,

    #[arg(
        long = "insecure",
        help = "Allow plain HTTP and skip TLS certificate verification"
    )]
    pub insecure: bool,

    #[arg(long = "jobs", short = 'j', help = "Concurrent blob transfers")]
    pub jobs: Option<usize>,

    #[arg(long = "retries", help = "Retries per blob for transient network failures")]
    pub retries: Option<u32>,

    #[arg(long = "timeout", help = "Network timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(
        long = "login",
        help = "Store the given credentials in the Docker config before copying"
    )]
    pub login: bool,

    #[arg(long = "log-level", help = "trace, debug, info, warn or error")]
    pub log_level: Option<String>,

    #[arg(long = "card-path", help = "Where to write the result card")]
    pub card_path: Option<PathBuf>,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }

    /// Fill unset options from `PLUGIN_*` environment variables
    pub fn from_env(self) -> Result<Self> {
        self.from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Args::from_env`] with a custom variable source.
    /// Command-line values take precedence.
    pub fn from_lookup<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        fill(&mut self.src, var("PLUGIN_SRC"));
        fill(&mut self.dst, var("PLUGIN_DST"));
        fill(&mut self.src_user, var("PLUGIN_SRC_USER"));
        fill(&mut self.src_pass, var("PLUGIN_SRC_PASS"));
        fill(&mut self.dst_user, var("PLUGIN_DST_USER"));
        fill(&mut self.dst_pass, var("PLUGIN_DST_PASS"));
        fill(&mut self.platform, var("PLUGIN_PLATFORM"));
        fill(&mut self.log_level, var("PLUGIN_LOG_LEVEL"));
        fill(&mut self.card_path, var("DRONE_CARD_PATH").map(PathBuf::from));

        if self.jobs.is_none() {
            self.jobs = parse_var("PLUGIN_JOBS", var("PLUGIN_JOBS"))?;
        }
        if self.retries.is_none() {
            self.retries = parse_var("PLUGIN_RETRIES", var("PLUGIN_RETRIES"))?;
        }
        if self.timeout.is_none() {
            self.timeout = parse_var("PLUGIN_TIMEOUT", var("PLUGIN_TIMEOUT"))?;
        }

        self.no_clobber |= parse_flag("PLUGIN_NOCLOBBER", var("PLUGIN_NOCLOBBER"))?;
        self.overwrite |= parse_flag("PLUGIN_OVERWRITE", var("PLUGIN_OVERWRITE"))?;
        self.insecure |= parse_flag("PLUGIN_INSECURE", var("PLUGIN_INSECURE"))?;
        self.login |= parse_flag("PLUGIN_LOGIN", var("PLUGIN_LOGIN"))?;

        Ok(self)
    }

    pub fn into_config(self) -> Result<CopyConfig> {
        let log_level = match &self.log_level {
            Some(level) => level.parse()?,
            None => LogLevel::Info,
        };

        Ok(CopyConfig {
            source: self.src.unwrap_or_default(),
            destination: self.dst.unwrap_or_default(),
            source_credential: ExplicitCredential::new(self.src_user, self.src_pass),
            destination_credential: ExplicitCredential::new(self.dst_user, self.dst_pass),
            platform: self.platform.unwrap_or_else(|| "all".to_string()),
            no_clobber: self.no_clobber,
            overwrite: self.overwrite,
            insecure: self.insecure,
            jobs: self.jobs.unwrap_or_else(default_concurrency),
            retries: self.retries.unwrap_or(DEFAULT_RETRIES),
            timeout: Duration::from_secs(self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            login: self.login,
            log_level,
            card_path: self.card_path,
        })
    }
}

fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

fn parse_var<T: FromStr>(name: &str, value: Option<String>) -> Result<Option<T>> {
    value
        .map(|v| {
            v.trim().parse().map_err(|_| {
                RegistryError::Configuration(format!("Invalid value for {}: '{}'", name, v))
            })
        })
        .transpose()
}

/// Boolean in the forms CI systems commonly emit
fn parse_flag(name: &str, value: Option<String>) -> Result<bool> {
    let Some(value) = value else {
        return Ok(false);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "no" | "off" => Ok(false),
        _ => Err(RegistryError::Configuration(format!(
            "Invalid boolean for {}: '{}'",
            name, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_env_fills_unset_options() {
        let args = Args::default()
            .from_lookup(lookup(&[
                ("PLUGIN_SRC", "src.example.com/app:v1"),
                ("PLUGIN_DST", "dst.example.com/app:v1"),
                ("PLUGIN_SRC_USER", "reader"),
                ("PLUGIN_SRC_PASS", "pw"),
                ("PLUGIN_PLATFORM", "linux/arm64"),
                ("PLUGIN_NOCLOBBER", "true"),
                ("PLUGIN_JOBS", "3"),
                ("PLUGIN_LOG_LEVEL", "debug"),
                ("DRONE_CARD_PATH", "/dev/stdout"),
            ]))
            .unwrap();

        let config = args.into_config().unwrap();
        assert_eq!(config.source, "src.example.com/app:v1");
        assert_eq!(config.platform, "linux/arm64");
        assert!(config.no_clobber);
        assert!(!config.insecure);
        assert_eq!(config.jobs, 3);
        assert_eq!(config.retries, DEFAULT_RETRIES);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.source_credential.principal.as_deref(), Some("reader"));
        assert!(config.destination_credential.is_empty());
        assert_eq!(config.card_path, Some(PathBuf::from("/dev/stdout")));
    }

    #[test]
    fn test_command_line_wins() {
        let args = Args::try_parse_from([
            "docker-image-copier",
            "--src",
            "cli.example.com/app:v1",
            "--jobs",
            "8",
        ])
        .unwrap()
        .from_lookup(lookup(&[
            ("PLUGIN_SRC", "env.example.com/app:v1"),
            ("PLUGIN_JOBS", "2"),
        ]))
        .unwrap();
        assert_eq!(args.src.as_deref(), Some("cli.example.com/app:v1"));
        assert_eq!(args.jobs, Some(8));
    }

    #[test]
    fn test_invalid_env_values() {
        assert!(
            Args::default()
                .from_lookup(lookup(&[("PLUGIN_JOBS", "many")]))
                .is_err()
        );
        assert!(
            Args::default()
                .from_lookup(lookup(&[("PLUGIN_INSECURE", "maybe")]))
                .is_err()
        );
        let args = Args::default()
            .from_lookup(lookup(&[("PLUGIN_LOG_LEVEL", "loud")]))
            .unwrap();
        assert!(args.into_config().is_err());
    }

    #[test]
    fn test_empty_env_values_are_unset() {
        let args = Args::default()
            .from_lookup(lookup(&[("PLUGIN_SRC_USER", ""), ("PLUGIN_INSECURE", "")]))
            .unwrap();
        assert_eq!(args.src_user, None);
        assert!(!args.insecure);
    }
}
