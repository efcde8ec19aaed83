//! Image reference parsing
//!
//! Parses locators such as `registry.example.com/ns/repo:tag` or
//! `registry.example.com/ns/repo@sha256:...` into their registry, repository
//! and tag-or-digest parts. Parsing is pure and never touches the network.

use crate::digest::Digest;
use crate::error::{RegistryError, Result};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_REGISTRY: &str = "index.docker.io";
pub const DEFAULT_TAG: &str = "latest";
const MAX_REPOSITORY_LEN: usize = 255;
const MAX_TAG_LEN: usize = 128;

/// A fully-qualified image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag_or_digest: String,
    pub is_digest: bool,
}

impl ImageReference {
    pub fn parse(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Err(RegistryError::MissingComponent {
                reference: input.to_string(),
                component: "repository",
            });
        }
        if input.chars().any(|c| c.is_whitespace()) {
            return Err(RegistryError::invalid_reference(input, "contains whitespace"));
        }

        let (rest, digest) = match input.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest)),
            None => (input, None),
        };

        // A ':' only introduces a tag when it follows the last '/'
        let last_slash = rest.rfind('/');
        let (name, tag) = match rest.rfind(':') {
            Some(idx) if last_slash.is_none_or(|slash| idx > slash) => {
                (&rest[..idx], Some(&rest[idx + 1..]))
            }
            _ => (rest, None),
        };

        let (registry, repository) = split_registry(input, name)?;

        let (tag_or_digest, is_digest) = match (digest, tag) {
            (Some(digest), _) => {
                let parsed: Digest = digest.parse().map_err(|e| {
                    RegistryError::invalid_reference(input, format!("bad digest: {}", e))
                })?;
                (parsed.to_string(), true)
            }
            (None, Some(tag)) => {
                validate_tag(input, tag)?;
                (tag.to_string(), false)
            }
            (None, None) => (DEFAULT_TAG.to_string(), false),
        };

        Ok(ImageReference {
            registry,
            repository,
            tag_or_digest,
            is_digest,
        })
    }

    /// The tag or digest used in `/v2/<repo>/manifests/<reference>`
    pub fn reference(&self) -> &str {
        &self.tag_or_digest
    }

    /// Pinned digest, if this is a digest reference
    pub fn digest(&self) -> Option<Digest> {
        if self.is_digest {
            self.tag_or_digest.parse().ok()
        } else {
            None
        }
    }

    pub fn tag(&self) -> Option<&str> {
        (!self.is_digest).then_some(self.tag_or_digest.as_str())
    }

    /// Same repository, addressed by `digest`
    pub fn with_digest(&self, digest: &Digest) -> Self {
        ImageReference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag_or_digest: digest.to_string(),
            is_digest: true,
        }
    }

    /// `registry/repository` without tag or digest
    pub fn context(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }
}

impl FromStr for ImageReference {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let separator = if self.is_digest { '@' } else { ':' };
        write!(
            f,
            "{}/{}{}{}",
            self.registry, self.repository, separator, self.tag_or_digest
        )
    }
}

impl Serialize for ImageReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn split_registry(input: &str, name: &str) -> Result<(String, String)> {
    let (registry, repository) = match name.split_once('/') {
        Some(("", _)) => {
            return Err(RegistryError::MissingComponent {
                reference: input.to_string(),
                component: "registry",
            });
        }
        Some((first, remainder)) if looks_like_host(first) => {
            (normalize_registry(first), remainder.to_string())
        }
        Some(_) | None => (DEFAULT_REGISTRY.to_string(), name.to_string()),
    };

    if repository.is_empty() {
        return Err(RegistryError::MissingComponent {
            reference: input.to_string(),
            component: "repository",
        });
    }

    validate_host(input, &registry)?;

    // Official Docker Hub images live under library/
    let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
        format!("library/{}", repository)
    } else {
        repository
    };
    validate_repository(input, &repository)?;

    Ok((registry, repository))
}

fn looks_like_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn normalize_registry(host: &str) -> String {
    match host {
        "docker.io" | "registry-1.docker.io" => DEFAULT_REGISTRY.to_string(),
        other => other.to_string(),
    }
}

fn validate_host(input: &str, host: &str) -> Result<()> {
    let (hostname, port) = match host.rsplit_once(':') {
        Some((hostname, port)) => (hostname, Some(port)),
        None => (host, None),
    };

    if let Some(port) = port {
        if port.is_empty() || port.len() > 5 || !port.chars().all(|c| c.is_ascii_digit()) {
            return Err(RegistryError::invalid_reference(
                input,
                format!("invalid registry port '{}'", port),
            ));
        }
    }

    if hostname.is_empty() {
        return Err(RegistryError::MissingComponent {
            reference: input.to_string(),
            component: "registry",
        });
    }

    for label in hostname.split('.') {
        let valid = !label.is_empty()
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-');
        if !valid {
            return Err(RegistryError::invalid_reference(
                input,
                format!("invalid registry host '{}'", host),
            ));
        }
    }
    Ok(())
}

fn validate_repository(input: &str, repository: &str) -> Result<()> {
    if repository.len() > MAX_REPOSITORY_LEN {
        return Err(RegistryError::invalid_reference(
            input,
            format!("repository longer than {} characters", MAX_REPOSITORY_LEN),
        ));
    }
    for segment in repository.split('/') {
        if !is_valid_path_segment(segment) {
            return Err(RegistryError::invalid_reference(
                input,
                format!("invalid repository path segment '{}'", segment),
            ));
        }
    }
    Ok(())
}

/// `[a-z0-9]+` runs joined by `.`, `_`, `__` or any number of `-`
fn is_valid_path_segment(segment: &str) -> bool {
    let is_alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let (Some(first), Some(last)) = (segment.chars().next(), segment.chars().last()) else {
        return false;
    };
    if !is_alnum(first) || !is_alnum(last) {
        return false;
    }

    let mut separator = String::new();
    for c in segment.chars() {
        if is_alnum(c) {
            let valid_run = separator.is_empty()
                || separator == "."
                || separator == "_"
                || separator == "__"
                || separator.chars().all(|s| s == '-');
            if !valid_run {
                return false;
            }
            separator.clear();
        } else if matches!(c, '.' | '_' | '-') {
            separator.push(c);
        } else {
            return false;
        }
    }
    true
}

fn validate_tag(input: &str, tag: &str) -> Result<()> {
    let mut chars = tag.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphanumeric() || first == '_')
                && tag.len() <= MAX_TAG_LEN
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        None => false,
    };
    if !valid {
        return Err(RegistryError::invalid_reference(
            input,
            format!("invalid tag '{}'", tag),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_parse_full_reference() {
        let r = ImageReference::parse("registry.example.com/ns/repo:v1.2").unwrap();
        assert_eq!(r.registry, "registry.example.com");
        assert_eq!(r.repository, "ns/repo");
        assert_eq!(r.tag(), Some("v1.2"));
        assert!(!r.is_digest);
    }

    #[test]
    fn test_parse_with_port_and_digest() {
        let input = format!("localhost:5000/app@{}", DIGEST);
        let r = ImageReference::parse(&input).unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "app");
        assert!(r.is_digest);
        assert_eq!(r.digest().unwrap().to_string(), DIGEST);
        assert_eq!(r.to_string(), input);
    }

    #[test]
    fn test_digest_wins_over_tag() {
        let r = ImageReference::parse(&format!("ghcr.io/org/app:v1@{}", DIGEST)).unwrap();
        assert!(r.is_digest);
        assert_eq!(r.reference(), DIGEST);
    }

    #[test]
    fn test_docker_hub_defaults() {
        let r = ImageReference::parse("alpine").unwrap();
        assert_eq!(r.to_string(), "index.docker.io/library/alpine:latest");

        let r = ImageReference::parse("docker.io/bitnami/redis:7").unwrap();
        assert_eq!(r.registry, DEFAULT_REGISTRY);
        assert_eq!(r.repository, "bitnami/redis");
    }

    #[test]
    fn test_missing_components() {
        assert!(matches!(
            ImageReference::parse("/repo:tag"),
            Err(RegistryError::MissingComponent {
                component: "registry",
                ..
            })
        ));
        assert!(matches!(
            ImageReference::parse("registry.example.com/:tag"),
            Err(RegistryError::MissingComponent {
                component: "repository",
                ..
            })
        ));
        assert!(matches!(
            ImageReference::parse(""),
            Err(RegistryError::MissingComponent { .. })
        ));
    }

    #[test]
    fn test_invalid_references() {
        for input in [
            "registry.example.com/Repo:tag",
            "registry.example.com/ns//repo",
            "registry.example.com/repo:",
            "registry.example.com/repo:-bad",
            "registry.example.com/repo@sha256:abc",
            "-bad-.example.com/repo",
            "registry.example.com:99999999/repo",
            "registry.example.com/repo..x",
            "registry.example.com/repo tag",
        ] {
            assert!(
                matches!(
                    ImageReference::parse(input),
                    Err(RegistryError::InvalidReference { .. })
                ),
                "expected InvalidReference for {}",
                input
            );
        }
    }

    #[test]
    fn test_path_segment_separators() {
        assert!(is_valid_path_segment("a__b"));
        assert!(is_valid_path_segment("a---b"));
        assert!(is_valid_path_segment("my.app_v2"));
        assert!(!is_valid_path_segment("a___b"));
        assert!(!is_valid_path_segment("a._b"));
        assert!(!is_valid_path_segment("_a"));
    }

    #[test]
    fn test_round_trip() {
        for input in [
            "src.example.com/app:v1",
            "alpine:3.19",
            "localhost/team/tool",
            "quay.io:443/ns/sub/repo:2024.01_rc-1",
            &format!("registry.example.com/ns/repo@{}", DIGEST),
        ] {
            let parsed = ImageReference::parse(input).unwrap();
            let reparsed = ImageReference::parse(&parsed.to_string()).unwrap();
            assert_eq!(parsed, reparsed, "round trip failed for {}", input);
        }
    }
}
