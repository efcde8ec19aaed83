//! Result card written for CI systems
//!
//! A card is `{"schema": ..., "data": ...}`. Written to `/dev/stdout` or
//! `/dev/stderr` it is wrapped in the `ESC ] 1338 ;` escape sequence with a
//! base64 payload so the CI log viewer can render it; any other path gets
//! the raw JSON.

use crate::copy::report::CopyReport;
use crate::digest::Digest;
use crate::error::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const CARD_SCHEMA: &str = "docker-image-copier";

const CARD_PREFIX: &str = "\u{1b}]1338;";
const CARD_SUFFIX: &str = "\u{1b}]0m\n";

#[derive(Serialize)]
struct Card<'a, T: Serialize> {
    schema: &'a str,
    data: &'a T,
}

/// Card payload summarizing a finished copy
#[derive(Debug, Clone, Serialize)]
pub struct CopySummary {
    pub source: String,
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    pub platforms: Vec<String>,
    pub blobs_copied: usize,
    pub blobs_skipped: usize,
    pub blobs_failed: usize,
    pub bytes_transferred: u64,
    pub manifests_pushed: usize,
}

impl From<&CopyReport> for CopySummary {
    fn from(report: &CopyReport) -> Self {
        Self {
            source: report.source.to_string(),
            destination: report.destination.to_string(),
            digest: report.digest.clone(),
            platforms: report.platforms.clone(),
            blobs_copied: report.succeeded().count(),
            blobs_skipped: report.skipped().count(),
            blobs_failed: report.failed().count(),
            bytes_transferred: report.bytes_transferred(),
            manifests_pushed: report.manifests_pushed.len(),
        }
    }
}

pub struct CardWriter {
    path: PathBuf,
    schema: String,
}

impl CardWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema: CARD_SCHEMA.to_string(),
        }
    }

    pub fn with_schema(mut self, schema: &str) -> Self {
        self.schema = schema.to_string();
        self
    }

    pub fn write<T: Serialize>(&self, data: &T) -> Result<()> {
        let json = serde_json::to_vec(&Card {
            schema: &self.schema,
            data,
        })?;

        if self.path == Path::new("/dev/stdout") {
            std::io::stdout().lock().write_all(&encode_terminal(&json))?;
        } else if self.path == Path::new("/dev/stderr") {
            std::io::stderr().lock().write_all(&encode_terminal(&json))?;
        } else {
            std::fs::write(&self.path, &json)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o644))?;
            }
        }
        Ok(())
    }
}

fn encode_terminal(json: &[u8]) -> Vec<u8> {
    format!("{}{}{}", CARD_PREFIX, BASE64.encode(json), CARD_SUFFIX).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_card_is_raw_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("card.json");
        CardWriter::new(&path)
            .with_schema("https://example.com/card.json")
            .write(&serde_json::json!({"digest": "sha256:abc"}))
            .unwrap();

        let card: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(card["schema"], "https://example.com/card.json");
        assert_eq!(card["data"]["digest"], "sha256:abc");
    }

    #[test]
    fn test_terminal_encoding() {
        let encoded = String::from_utf8(encode_terminal(b"{\"a\":1}")).unwrap();
        assert!(encoded.starts_with("\u{1b}]1338;"));
        assert!(encoded.ends_with("\u{1b}]0m\n"));
        let payload = &encoded[CARD_PREFIX.len()..encoded.len() - CARD_SUFFIX.len()];
        assert_eq!(BASE64.decode(payload).unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn test_summary_from_report() {
        let report = CopyReport::new(
            "src.example.com/app:v1".parse().unwrap(),
            "dst.example.com/app:v1".parse().unwrap(),
        );
        let summary = CopySummary::from(&report);
        assert_eq!(summary.destination, "dst.example.com/app:v1");
        assert_eq!(summary.blobs_copied, 0);
        let value = serde_json::to_value(&summary).unwrap();
        assert!(value.get("digest").is_none());
    }
}
