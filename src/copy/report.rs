//! Transfer jobs and the copy report built from them

use crate::digest::Digest;
use crate::error::RegistryError;
use crate::image::manifest::Descriptor;
use crate::image::reference::ImageReference;
use serde::{Serialize, Serializer};

/// Lifecycle of a single blob transfer.
///
/// `Pending -> InFlight -> {Skipped, Succeeded, Failed}`; the last three
/// are terminal.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    InFlight,
    /// Already present at the destination
    Skipped,
    Succeeded {
        bytes: u64,
    },
    Failed {
        #[serde(serialize_with = "error_message")]
        error: RegistryError,
        /// Bytes read from the source before the failure, when known
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes_transferred: Option<u64>,
    },
}

fn error_message<S: Serializer>(error: &RegistryError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Skipped | JobState::Succeeded { .. } | JobState::Failed { .. }
        )
    }

    /// Blob is available at the destination
    pub fn is_ok(&self) -> bool {
        matches!(self, JobState::Skipped | JobState::Succeeded { .. })
    }
}

/// Copy of one blob from source to destination
#[derive(Debug, Clone, Serialize)]
pub struct TransferJob {
    pub descriptor: Descriptor,
    pub source: ImageReference,
    pub destination: ImageReference,
    #[serde(flatten)]
    pub state: JobState,
    pub attempts: u32,
}

impl TransferJob {
    pub fn new(descriptor: Descriptor, source: ImageReference, destination: ImageReference) -> Self {
        Self {
            descriptor,
            source,
            destination,
            state: JobState::Pending,
            attempts: 0,
        }
    }

    pub fn digest(&self) -> &Digest {
        &self.descriptor.digest
    }

    pub fn error(&self) -> Option<&RegistryError> {
        match &self.state {
            JobState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Outcome of a copy, successful or not
#[derive(Debug, Clone, Serialize)]
pub struct CopyReport {
    pub source: ImageReference,
    pub destination: ImageReference,
    /// Digest of the root manifest as pushed (or as it would have been)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub platforms: Vec<String>,
    pub jobs: Vec<TransferJob>,
    pub manifests_pushed: Vec<Digest>,
    pub root_pushed: bool,
}

impl CopyReport {
    pub fn new(source: ImageReference, destination: ImageReference) -> Self {
        Self {
            source,
            destination,
            digest: None,
            media_type: None,
            platforms: Vec::new(),
            jobs: Vec::new(),
            manifests_pushed: Vec::new(),
            root_pushed: false,
        }
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &TransferJob> {
        self.jobs
            .iter()
            .filter(|j| matches!(j.state, JobState::Succeeded { .. }))
    }

    pub fn skipped(&self) -> impl Iterator<Item = &TransferJob> {
        self.jobs.iter().filter(|j| matches!(j.state, JobState::Skipped))
    }

    pub fn failed(&self) -> impl Iterator<Item = &TransferJob> {
        self.jobs
            .iter()
            .filter(|j| matches!(j.state, JobState::Failed { .. }))
    }

    /// Jobs never dispatched, only non-empty after cancellation
    pub fn pending(&self) -> impl Iterator<Item = &TransferJob> {
        self.jobs.iter().filter(|j| !j.state.is_terminal())
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.jobs
            .iter()
            .map(|j| match j.state {
                JobState::Succeeded { bytes } => bytes,
                _ => 0,
            })
            .sum()
    }

    pub fn is_complete(&self) -> bool {
        self.jobs.iter().all(|j| j.state.is_ok())
    }

    /// One-line outcome used in error messages and logs
    pub fn outcome_summary(&self) -> String {
        let mut summary = format!(
            "{} -> {}: {} blobs ({} copied, {} already present, {} failed",
            self.source,
            self.destination,
            self.jobs.len(),
            self.succeeded().count(),
            self.skipped().count(),
            self.failed().count()
        );
        let pending = self.pending().count();
        if pending > 0 {
            summary.push_str(&format!(", {} not started", pending));
        }
        summary.push_str(&format!("), {} manifests pushed", self.manifests_pushed.len()));

        let failures: Vec<String> = self
            .failed()
            .filter_map(|j| j.error().map(|e| format!("{}: {}", j.digest().short(), e)))
            .collect();
        if !failures.is_empty() {
            summary.push_str(&format!("; failures: {}", failures.join("; ")));
        }
        summary
    }
}
