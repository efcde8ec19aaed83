//! Platform selection for multi-architecture images

use crate::error::{RegistryError, Result};
use crate::image::manifest::{Descriptor, ManifestList, Platform};
use std::fmt;
use std::str::FromStr;

/// Which entries of a manifest list to copy
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PlatformSpec {
    #[default]
    All,
    Specific(Platform),
}

impl PlatformSpec {
    /// Whether `platform` satisfies this spec.
    ///
    /// Fields left empty in the spec match anything; fields that are set
    /// must match exactly.
    pub fn matches(&self, platform: &Platform) -> bool {
        let PlatformSpec::Specific(wanted) = self else {
            return true;
        };
        wanted.os == platform.os
            && wanted.architecture == platform.architecture
            && wanted
                .variant
                .as_ref()
                .is_none_or(|v| platform.variant.as_ref() == Some(v))
            && wanted
                .os_version
                .as_ref()
                .is_none_or(|v| platform.os_version.as_ref() == Some(v))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, PlatformSpec::All)
    }
}

impl FromStr for PlatformSpec {
    type Err = RegistryError;

    /// Parses `all` or `os/arch[/variant][:osversion]`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s == "all" {
            return Ok(PlatformSpec::All);
        }
        if s.contains(',') {
            return Err(RegistryError::Configuration(format!(
                "Invalid platform '{}': select one platform or 'all'",
                s
            )));
        }

        let (path, os_version) = match s.split_once(':') {
            Some((path, version)) if !version.is_empty() => (path, Some(version.to_string())),
            Some(_) => {
                return Err(RegistryError::Configuration(format!(
                    "Invalid platform '{}': empty os version",
                    s
                )));
            }
            None => (s, None),
        };

        let parts: Vec<&str> = path.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) || !(2..=3).contains(&parts.len()) {
            return Err(RegistryError::Configuration(format!(
                "Invalid platform '{}': expected os/arch[/variant]",
                s
            )));
        }

        let mut platform = Platform::new(parts[0], parts[1], parts.get(2).copied());
        platform.os_version = os_version;
        Ok(PlatformSpec::Specific(platform))
    }
}

impl fmt::Display for PlatformSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformSpec::All => f.write_str("all"),
            PlatformSpec::Specific(platform) => write!(f, "{}", platform),
        }
    }
}

/// Select the entries of `list` matching `spec`, preserving source order.
///
/// A specific spec that matches nothing is a configuration mistake and
/// fails with `NoMatchingPlatform` instead of producing an empty copy.
pub fn filter(list: &ManifestList, spec: &PlatformSpec, reference: &str) -> Result<Vec<Descriptor>> {
    if spec.is_all() {
        return Ok(list.manifests.clone());
    }

    let selected: Vec<Descriptor> = list
        .manifests
        .iter()
        .filter(|entry| entry.platform.as_ref().is_some_and(|p| spec.matches(p)))
        .cloned()
        .collect();

    if selected.is_empty() {
        let available = list
            .manifests
            .iter()
            .filter_map(|entry| entry.platform.as_ref().map(|p| p.to_string()))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(RegistryError::NoMatchingPlatform {
            platform: spec.to_string(),
            reference: reference.to_string(),
            available,
        });
    }

    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::image::manifest::media_types;

    fn entry(name: &str, platform: Option<Platform>) -> Descriptor {
        let mut descriptor =
            Descriptor::new(media_types::OCI_MANIFEST, Digest::sha256(name.as_bytes()), 100);
        descriptor.platform = platform;
        descriptor
    }

    fn sample_list() -> ManifestList {
        ManifestList {
            schema_version: 2,
            media_type: Some(media_types::OCI_INDEX.to_string()),
            manifests: vec![
                entry("amd64", Some(Platform::new("linux", "amd64", None))),
                entry("arm64", Some(Platform::new("linux", "arm64", Some("v8")))),
                entry("armv7", Some(Platform::new("linux", "arm", Some("v7")))),
                entry("armv6", Some(Platform::new("linux", "arm", Some("v6")))),
                entry("attestation", Some(Platform::new("unknown", "unknown", None))),
            ],
        }
    }

    #[test]
    fn test_parse_specs() {
        assert_eq!("all".parse::<PlatformSpec>().unwrap(), PlatformSpec::All);
        assert_eq!("".parse::<PlatformSpec>().unwrap(), PlatformSpec::All);

        let PlatformSpec::Specific(p) = "linux/arm/v7".parse::<PlatformSpec>().unwrap() else {
            panic!("expected specific platform");
        };
        assert_eq!(p.variant.as_deref(), Some("v7"));

        let PlatformSpec::Specific(p) =
            "windows/amd64:10.0.17763.1879".parse::<PlatformSpec>().unwrap()
        else {
            panic!("expected specific platform");
        };
        assert_eq!(p.os_version.as_deref(), Some("10.0.17763.1879"));

        for bad in [
            "linux",
            "linux/",
            "linux/arm/v7/extra",
            "/amd64",
            "linux/amd64:",
            "linux/amd64,linux/arm64",
        ] {
            assert!(bad.parse::<PlatformSpec>().is_err(), "{} should not parse", bad);
        }
    }

    #[test]
    fn test_all_returns_every_entry_in_order() {
        let list = sample_list();
        let selected = filter(&list, &PlatformSpec::All, "app").unwrap();
        assert_eq!(selected, list.manifests);
    }

    #[test]
    fn test_specific_platform_without_variant_is_wildcard() {
        let list = sample_list();
        let spec: PlatformSpec = "linux/arm64".parse().unwrap();
        let selected = filter(&list, &spec, "app").unwrap();
        assert_eq!(selected, vec![list.manifests[1].clone()]);
    }

    #[test]
    fn test_multiple_matches_keep_source_order() {
        let list = sample_list();
        let spec: PlatformSpec = "linux/arm".parse().unwrap();
        let selected = filter(&list, &spec, "app").unwrap();
        assert_eq!(selected, vec![list.manifests[2].clone(), list.manifests[3].clone()]);

        let spec: PlatformSpec = "linux/arm/v6".parse().unwrap();
        let selected = filter(&list, &spec, "app").unwrap();
        assert_eq!(selected, vec![list.manifests[3].clone()]);
    }

    #[test]
    fn test_zero_matches_is_an_error() {
        let list = sample_list();
        let spec: PlatformSpec = "windows/amd64".parse().unwrap();
        let err = filter(&list, &spec, "src.example.com/app:v1").unwrap_err();
        match err {
            RegistryError::NoMatchingPlatform { available, .. } => {
                assert!(available.contains("linux/arm64/v8"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_entries_without_platform_only_pass_all() {
        let list = ManifestList {
            schema_version: 2,
            media_type: None,
            manifests: vec![entry("bare", None)],
        };
        assert_eq!(filter(&list, &PlatformSpec::All, "app").unwrap().len(), 1);
        let spec: PlatformSpec = "linux/amd64".parse().unwrap();
        assert!(filter(&list, &spec, "app").is_err());
    }
}
