//! Docker v2 and OCI manifest types
//!
//! Manifests are parsed for inspection only. What gets pushed is always the
//! original byte sequence held in [`RawManifest`], so digests survive a copy
//! unchanged.

use crate::digest::Digest;
use crate::error::{RegistryError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

pub mod media_types {
    pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
    pub const DOCKER_MANIFEST_V1_SIGNED: &str =
        "application/vnd.docker.distribution.manifest.v1+prettyjws";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const DOCKER_FOREIGN_LAYER: &str =
        "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
    pub const OCI_NONDISTRIBUTABLE_LAYER_PREFIX: &str =
        "application/vnd.oci.image.layer.nondistributable.";
}

/// `Accept` header value covering every manifest format we can copy
pub const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestType {
    DockerV2,
    DockerList,
    OciManifest,
    OciIndex,
}

impl ManifestType {
    pub fn from_media_type(media_type: &str) -> Result<Self> {
        match media_type {
            media_types::DOCKER_MANIFEST_V2 => Ok(ManifestType::DockerV2),
            media_types::DOCKER_MANIFEST_LIST => Ok(ManifestType::DockerList),
            media_types::OCI_MANIFEST => Ok(ManifestType::OciManifest),
            media_types::OCI_INDEX => Ok(ManifestType::OciIndex),
            other => Err(RegistryError::UnsupportedMediaType(other.to_string())),
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, ManifestType::DockerList | ManifestType::OciIndex)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "os.features", default, skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
}

impl Platform {
    pub fn new(os: &str, architecture: &str, variant: Option<&str>) -> Self {
        Platform {
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant: variant.map(str::to_string),
            ..Default::default()
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        if let Some(os_version) = &self.os_version {
            write!(f, ":{}", os_version)?;
        }
        Ok(())
    }
}

/// Pointer to content: media type, digest and size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl Descriptor {
    pub fn new(media_type: &str, digest: Digest, size: u64) -> Self {
        Descriptor {
            media_type: media_type.to_string(),
            digest,
            size,
            platform: None,
            urls: None,
            annotations: None,
        }
    }

    /// Foreign layers are fetched from their own URLs and never live in a registry
    pub fn is_distributable(&self) -> bool {
        self.media_type != media_types::DOCKER_FOREIGN_LAYER
            && !self
                .media_type
                .starts_with(media_types::OCI_NONDISTRIBUTABLE_LAYER_PREFIX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Config plus every layer that must be copied between registries
    pub fn blobs(&self) -> impl Iterator<Item = &Descriptor> {
        std::iter::once(&self.config).chain(self.layers.iter().filter(|l| l.is_distributable()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

#[derive(Debug, Clone)]
pub enum Manifest {
    Image(ImageManifest),
    List(ManifestList),
}

/// A manifest exactly as stored in a registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawManifest {
    pub media_type: String,
    pub bytes: Bytes,
    pub digest: Digest,
}

impl RawManifest {
    pub fn new(media_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        RawManifest {
            media_type: media_type.into(),
            digest: Digest::sha256(&bytes),
            bytes,
        }
    }

    /// Build from a registry response, resolving the media type from the
    /// `Content-Type` header or, failing that, the document itself
    pub fn from_response(content_type: Option<&str>, bytes: Bytes) -> Result<Self> {
        let media_type = detect_media_type(content_type, &bytes)?;
        Ok(Self::new(media_type, bytes))
    }

    pub fn manifest_type(&self) -> Result<ManifestType> {
        ManifestType::from_media_type(&self.media_type)
    }

    pub fn parse(&self) -> Result<Manifest> {
        if self.manifest_type()?.is_list() {
            Ok(Manifest::List(serde_json::from_slice(&self.bytes)?))
        } else {
            Ok(Manifest::Image(serde_json::from_slice(&self.bytes)?))
        }
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(&self.media_type, self.digest.clone(), self.bytes.len() as u64)
    }

    /// Re-serialize a manifest list keeping only `selected` entries.
    ///
    /// Every other field of the original document is preserved. Entry order
    /// follows the original list.
    pub fn retain_entries(&self, selected: &[Descriptor]) -> Result<Self> {
        let keep: HashSet<&Digest> = selected.iter().map(|d| &d.digest).collect();
        let mut document: serde_json::Value = serde_json::from_slice(&self.bytes)?;

        let entries = document
            .get_mut("manifests")
            .and_then(|m| m.as_array_mut())
            .ok_or_else(|| RegistryError::Parse("Manifest list has no manifests array".into()))?;

        let mut retained = Vec::with_capacity(entries.len());
        for entry in entries.drain(..) {
            let digest: Digest = entry
                .get("digest")
                .and_then(|d| d.as_str())
                .ok_or_else(|| RegistryError::Parse("Manifest list entry without digest".into()))?
                .parse()?;
            if keep.contains(&digest) {
                retained.push(entry);
            }
        }
        *entries = retained;

        Ok(Self::new(self.media_type.clone(), serde_json::to_vec(&document)?))
    }
}

/// Determine the manifest media type of a registry response
pub fn detect_media_type(content_type: Option<&str>, bytes: &[u8]) -> Result<String> {
    let header = content_type
        .map(|ct| ct.split(';').next().unwrap_or_default().trim().to_string())
        .filter(|ct| ct.starts_with("application/vnd."));

    if let Some(media_type) = header {
        ManifestType::from_media_type(&media_type)?;
        return Ok(media_type);
    }

    let document: serde_json::Value = serde_json::from_slice(bytes)?;
    if let Some(media_type) = document.get("mediaType").and_then(|m| m.as_str()) {
        ManifestType::from_media_type(media_type)?;
        return Ok(media_type.to_string());
    }

    // OCI documents may omit mediaType entirely
    if document.get("manifests").is_some() {
        Ok(media_types::OCI_INDEX.to_string())
    } else if document.get("layers").is_some() && document.get("config").is_some() {
        Ok(media_types::OCI_MANIFEST.to_string())
    } else if document.get("fsLayers").is_some() {
        Err(RegistryError::UnsupportedMediaType(
            media_types::DOCKER_MANIFEST_V1.to_string(),
        ))
    } else {
        Err(RegistryError::Parse(
            "Unable to determine manifest media type".to_string(),
        ))
    }
}
