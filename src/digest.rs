//! Content digests for registry objects
//!
//! Every blob and manifest is addressed by a [`Digest`] of the form
//! `algorithm:hex`. The same value is used as the dedup key in the
//! transfer scheduler and as the integrity check after every fetch.

use crate::error::{RegistryError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    /// Length of the lowercase hex encoding
    pub fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Sha512 => 128,
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            other => Err(RegistryError::Parse(format!(
                "Unsupported digest algorithm: {}",
                other
            ))),
        }
    }
}

/// A content hash, always stored as algorithm plus lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Digest {
    /// Compute the SHA256 digest of `data`
    pub fn sha256(data: &[u8]) -> Self {
        Self::compute(DigestAlgorithm::Sha256, data)
    }

    pub fn compute(algorithm: DigestAlgorithm, data: &[u8]) -> Self {
        let mut hasher = DigestHasher::new(algorithm);
        hasher.update(data);
        hasher.finalize()
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Verify that `data` hashes to this digest
    pub fn verify(&self, data: &[u8], context: &str) -> Result<()> {
        let computed = Self::compute(self.algorithm, data);
        if computed != *self {
            return Err(RegistryError::DigestMismatch {
                context: context.to_string(),
                expected: self.to_string(),
                actual: computed.to_string(),
            });
        }
        Ok(())
    }

    /// Truncated form for log output
    pub fn short(&self) -> String {
        let end = self.hex.len().min(12);
        format!("{}:{}", self.algorithm.as_str(), &self.hex[..end])
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| RegistryError::Parse(format!("Digest missing algorithm: {}", s)))?;
        let algorithm: DigestAlgorithm = algorithm.parse()?;

        if hex.len() != algorithm.hex_len() {
            return Err(RegistryError::Parse(format!(
                "Invalid {} digest length: expected {} hex characters, got {}",
                algorithm.as_str(),
                algorithm.hex_len(),
                hex.len()
            )));
        }
        if !hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
            return Err(RegistryError::Parse(format!(
                "Invalid digest: expected lowercase hex, got '{}'",
                hex
            )));
        }

        Ok(Digest {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher used while streaming blobs
pub enum DigestHasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl DigestHasher {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha256 => DigestHasher::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => DigestHasher::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            DigestHasher::Sha256(h) => h.update(data),
            DigestHasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        match self {
            DigestHasher::Sha256(h) => Digest {
                algorithm: DigestAlgorithm::Sha256,
                hex: hex::encode(h.finalize()),
            },
            DigestHasher::Sha512(h) => Digest {
                algorithm: DigestAlgorithm::Sha512,
                hex: hex::encode(h.finalize()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str =
        "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_compute_sha256() {
        assert_eq!(Digest::sha256(b"hello world").to_string(), HELLO_SHA256);
    }

    #[test]
    fn test_empty_blob_digest() {
        assert_eq!(
            Digest::sha256(b"").to_string(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_parse_digest() {
        let digest: Digest = HELLO_SHA256.parse().unwrap();
        assert_eq!(digest.algorithm(), DigestAlgorithm::Sha256);
        assert_eq!(digest.short(), "sha256:b94d27b9934d");

        assert!("sha256:invalid".parse::<Digest>().is_err());
        assert!("md5:b94d27b9934d3e08a52e52d7da7dabfa".parse::<Digest>().is_err());
        assert!(
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
                .parse::<Digest>()
                .is_err()
        );
        assert!(HELLO_SHA256.to_uppercase().replace("SHA256", "sha256").parse::<Digest>().is_err());
    }

    #[test]
    fn test_sha512() {
        let digest = Digest::compute(DigestAlgorithm::Sha512, b"hello world");
        assert_eq!(digest.hex().len(), 128);
        let reparsed: Digest = digest.to_string().parse().unwrap();
        assert_eq!(reparsed, digest);
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let mut hasher = DigestHasher::new(DigestAlgorithm::Sha256);
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize().to_string(), HELLO_SHA256);
    }

    #[test]
    fn test_verify() {
        let digest: Digest = HELLO_SHA256.parse().unwrap();
        assert!(digest.verify(b"hello world", "blob").is_ok());
        let err = digest.verify(b"hello there", "blob").unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
    }

    #[test]
    fn test_serde_as_string() {
        let digest: Digest = HELLO_SHA256.parse().unwrap();
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", HELLO_SHA256));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
