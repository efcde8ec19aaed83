//! Bounded-concurrency blob transfer
//!
//! Each job streams one blob from the source into a spool file while
//! hashing it, verifies size and digest, and only then uploads to the
//! destination. The scheduler itself never retries.

use crate::copy::report::{JobState, TransferJob};
use crate::digest::{Digest, DigestHasher};
use crate::error::{RegistryError, Result};
use crate::logging::Logger;
use crate::registry::Registry;
use futures::StreamExt;
use futures::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Destination presence by digest, shared by all workers.
///
/// Each digest is looked up at most once; concurrent lookups of the same
/// digest wait for the first one.
#[derive(Default)]
pub struct PresenceCache {
    entries: Mutex<HashMap<Digest, Arc<tokio::sync::Mutex<Option<bool>>>>>,
}

impl PresenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, digest: &Digest) -> Arc<tokio::sync::Mutex<Option<bool>>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.entry(digest.clone()).or_default().clone()
    }

    pub async fn is_present(&self, registry: &dyn Registry, repository: &str, digest: &Digest) -> Result<bool> {
        let slot = self.slot(digest);
        let mut known = slot.lock().await;
        if let Some(present) = *known {
            return Ok(present);
        }
        let present = registry.blob_exists(repository, digest).await?;
        *known = Some(present);
        Ok(present)
    }

    pub async fn mark_present(&self, digest: &Digest) {
        let slot = self.slot(digest);
        *slot.lock().await = Some(true);
    }
}

struct JobFailure {
    error: RegistryError,
    bytes_transferred: Option<u64>,
}

impl From<RegistryError> for JobFailure {
    fn from(error: RegistryError) -> Self {
        Self {
            error,
            bytes_transferred: None,
        }
    }
}

pub struct TransferScheduler {
    source: Arc<dyn Registry>,
    destination: Arc<dyn Registry>,
    concurrency: usize,
    overwrite: bool,
    presence: Arc<PresenceCache>,
    spool_dir: Option<PathBuf>,
    output: Logger,
}

impl TransferScheduler {
    pub fn new(source: Arc<dyn Registry>, destination: Arc<dyn Registry>, output: Logger) -> Self {
        Self {
            source,
            destination,
            concurrency: 1,
            overwrite: false,
            presence: Arc::new(PresenceCache::new()),
            spool_dir: None,
            output,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Upload even when the destination already has the blob
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_presence_cache(mut self, presence: Arc<PresenceCache>) -> Self {
        self.presence = presence;
        self
    }

    pub fn with_spool_dir(mut self, spool_dir: Option<PathBuf>) -> Self {
        self.spool_dir = spool_dir;
        self
    }

    /// Run `jobs` with at most `concurrency` in flight.
    ///
    /// Returns the jobs in input order. Jobs not yet dispatched when
    /// `cancel` fires stay `Pending`; jobs already in flight finish.
    pub async fn transfer(&self, jobs: Vec<TransferJob>, cancel: &CancellationToken) -> Vec<TransferJob> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        self.output.detail(&format!(
            "Transferring {} blobs with concurrency {}",
            jobs.len(),
            self.concurrency
        ));

        let transfers = jobs.into_iter().map(|job| {
            let semaphore = semaphore.clone();
            async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return job,
                    permit = semaphore.acquire_owned() => permit,
                };
                let Ok(_permit) = permit else {
                    return job;
                };
                if cancel.is_cancelled() {
                    return job;
                }
                self.run(job).await
            }
        });

        join_all(transfers).await
    }

    async fn run(&self, mut job: TransferJob) -> TransferJob {
        job.state = JobState::InFlight;
        job.attempts += 1;

        job.state = match self.copy_blob(&job).await {
            Ok(state) => state,
            Err(failure) => JobState::Failed {
                error: failure.error,
                bytes_transferred: failure.bytes_transferred,
            },
        };

        let digest = job.digest().short();
        match &job.state {
            JobState::Skipped => self
                .output
                .detail(&format!("Blob {} already present, skipped", digest)),
            JobState::Succeeded { bytes } => self.output.step(&format!(
                "Copied blob {} ({})",
                digest,
                self.output.format_size(*bytes)
            )),
            JobState::Failed { error, .. } => self
                .output
                .warning(&format!("Blob {} failed: {}", digest, error)),
            JobState::Pending | JobState::InFlight => {}
        }
        job
    }

    async fn copy_blob(&self, job: &TransferJob) -> std::result::Result<JobState, JobFailure> {
        let descriptor = &job.descriptor;
        let digest = &descriptor.digest;
        let destination_repo = &job.destination.repository;

        if !self.overwrite
            && self
                .presence
                .is_present(self.destination.as_ref(), destination_repo, digest)
                .await?
        {
            return Ok(JobState::Skipped);
        }

        let spool = match &self.spool_dir {
            Some(dir) => tempfile::NamedTempFile::new_in(dir),
            None => tempfile::NamedTempFile::new(),
        }
        .map_err(RegistryError::from)?;
        let mut file = tokio::fs::File::from_std(spool.reopen().map_err(RegistryError::from)?);

        let mut stream = self.source.get_blob(&job.source.repository, digest).await?;
        let mut hasher = DigestHasher::new(digest.algorithm());
        let mut bytes: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|error| JobFailure {
                error,
                bytes_transferred: Some(bytes),
            })?;
            bytes += chunk.len() as u64;
            if bytes > descriptor.size {
                return Err(JobFailure {
                    error: RegistryError::SizeMismatch {
                        digest: digest.to_string(),
                        expected: descriptor.size,
                        actual: bytes,
                    },
                    bytes_transferred: Some(bytes),
                });
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(|e| JobFailure {
                error: e.into(),
                bytes_transferred: Some(bytes),
            })?;
        }
        file.flush().await.map_err(RegistryError::from)?;
        drop(file);

        if bytes != descriptor.size {
            return Err(JobFailure {
                error: RegistryError::SizeMismatch {
                    digest: digest.to_string(),
                    expected: descriptor.size,
                    actual: bytes,
                },
                bytes_transferred: Some(bytes),
            });
        }
        let actual = hasher.finalize();
        if actual != *digest {
            return Err(JobFailure {
                error: RegistryError::DigestMismatch {
                    context: format!("blob from {}", job.source.context()),
                    expected: digest.to_string(),
                    actual: actual.to_string(),
                },
                bytes_transferred: Some(bytes),
            });
        }

        self.destination
            .put_blob(destination_repo, digest, bytes, spool.path())
            .await
            .map_err(|error| JobFailure {
                error,
                bytes_transferred: Some(bytes),
            })?;
        self.presence.mark_present(digest).await;

        Ok(JobState::Succeeded { bytes })
    }
}
