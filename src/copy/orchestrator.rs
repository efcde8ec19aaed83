//! End-to-end image copy
//!
//! Resolves the source manifest graph, schedules one transfer per unique
//! blob, and pushes manifests only after every transfer has finished,
//! children first and the root last.

use crate::copy::fetcher::{FetchedManifest, ManifestFetcher};
use crate::copy::report::{CopyReport, JobState, TransferJob};
use crate::copy::scheduler::{PresenceCache, TransferScheduler};
use crate::digest::Digest;
use crate::error::{RegistryError, Result};
use crate::image::manifest::{Descriptor, ImageManifest, Manifest, RawManifest};
use crate::image::platform::{self, PlatformSpec};
use crate::image::reference::ImageReference;
use crate::logging::Logger;
use crate::registry::Registry;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_RETRIES: u32 = 2;

#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub platform: PlatformSpec,
    /// Maximum blob transfers in flight
    pub concurrency: usize,
    /// Upload blobs even when the destination already has them
    pub overwrite: bool,
    /// Refuse to replace a destination tag pointing at different content
    pub no_clobber: bool,
    /// Whole-job retries for transport failures
    pub retries: u32,
    /// Delay before the first retry round, doubled for each further round
    pub retry_backoff: Duration,
    /// Directory for blob spool files, system temp dir when unset
    pub spool_dir: Option<PathBuf>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            platform: PlatformSpec::All,
            concurrency: default_concurrency(),
            overwrite: false,
            no_clobber: false,
            retries: DEFAULT_RETRIES,
            retry_backoff: Duration::from_secs(1),
            spool_dir: None,
        }
    }
}

/// Number of available processing units, at least one
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Image manifest to push by digest once its blobs are in place
struct PlannedImage {
    raw: RawManifest,
    manifest: ImageManifest,
}

/// Nested index and the digests of its entries
struct PlannedIndex {
    raw: RawManifest,
    children: Vec<Digest>,
}

/// Everything to copy, resolved from the source before any write
struct CopyPlan {
    root: RawManifest,
    /// Entries of the root index after filtering, empty for a single image
    root_children: Vec<Digest>,
    images: Vec<PlannedImage>,
    indexes: Vec<PlannedIndex>,
    platforms: Vec<String>,
}

pub struct CopyOrchestrator {
    source: Arc<dyn Registry>,
    destination: Arc<dyn Registry>,
    options: CopyOptions,
    output: Logger,
}

impl CopyOrchestrator {
    pub fn new(
        source: Arc<dyn Registry>,
        destination: Arc<dyn Registry>,
        options: CopyOptions,
        output: Logger,
    ) -> Self {
        Self {
            source,
            destination,
            options,
            output,
        }
    }

    /// Copy `src` to `dst`.
    ///
    /// Succeeds only if every blob ended up at the destination and the root
    /// manifest was pushed under `dst`.
    pub async fn copy(
        &self,
        src: &ImageReference,
        dst: &ImageReference,
        cancel: &CancellationToken,
    ) -> Result<CopyReport> {
        self.output.section(&format!("Copying {} to {}", src, dst));
        let mut report = CopyReport::new(src.clone(), dst.clone());

        let fetcher = ManifestFetcher::new(self.source.clone(), self.output.clone());
        let root = fetcher.fetch(src).await?;
        let plan = self.plan(&fetcher, root).await?;

        report.digest = Some(plan.root.digest.clone());
        report.media_type = Some(plan.root.media_type.clone());
        report.platforms = plan.platforms.clone();

        if let Some(pinned) = dst.digest() {
            if pinned != plan.root.digest {
                return Err(RegistryError::DigestMismatch {
                    context: format!("destination {}", dst),
                    expected: pinned.to_string(),
                    actual: plan.root.digest.to_string(),
                });
            }
        }
        self.check_clobber(dst, &plan.root.digest).await?;

        report.jobs = self.run_jobs(self.build_jobs(src, dst, &plan), cancel).await;

        if cancel.is_cancelled() {
            self.output.warning("Copy cancelled, no manifests pushed");
            return Err(RegistryError::Cancelled(Box::new(report)));
        }

        self.push_manifests(dst, &plan, &mut report).await?;

        if !report.is_complete() || !report.root_pushed {
            if let Some(mismatch) = report
                .failed()
                .filter_map(|job| job.error())
                .find(|e| matches!(e, RegistryError::DigestMismatch { .. }))
            {
                return Err(mismatch.clone());
            }
            return Err(RegistryError::PartialTransfer(Box::new(report)));
        }

        self.output.summary_kv(
            "Copy complete",
            &[
                ("Destination", dst.to_string()),
                ("Digest", plan.root.digest.to_string()),
                ("Blobs copied", report.succeeded().count().to_string()),
                ("Blobs present", report.skipped().count().to_string()),
                (
                    "Transferred",
                    self.output.format_size(report.bytes_transferred()),
                ),
                ("Elapsed", self.output.format_duration(self.output.elapsed())),
            ],
        );
        Ok(report)
    }

    async fn plan(&self, fetcher: &ManifestFetcher, root: FetchedManifest) -> Result<CopyPlan> {
        let FetchedManifest {
            reference,
            raw,
            manifest,
        } = root;

        let list = match manifest {
            Manifest::Image(manifest) => {
                let mut platforms = Vec::new();
                if let PlatformSpec::Specific(_) = &self.options.platform {
                    let actual = fetcher
                        .fetch_config(&reference.repository, &manifest.config)
                        .await?;
                    if !self.options.platform.matches(&actual) {
                        return Err(RegistryError::NoMatchingPlatform {
                            platform: self.options.platform.to_string(),
                            reference: reference.to_string(),
                            available: actual.to_string(),
                        });
                    }
                    platforms.push(actual.to_string());
                }
                return Ok(CopyPlan {
                    root: raw.clone(),
                    root_children: Vec::new(),
                    images: vec![PlannedImage { raw, manifest }],
                    indexes: Vec::new(),
                    platforms,
                });
            }
            Manifest::List(list) => list,
        };

        let selected = platform::filter(&list, &self.options.platform, &reference.to_string())?;
        let root = if selected.len() == list.manifests.len() {
            raw
        } else {
            self.output.detail(&format!(
                "Selected {} of {} platforms",
                selected.len(),
                list.manifests.len()
            ));
            raw.retain_entries(&selected)?
        };

        let root_children = selected.iter().map(|d| d.digest.clone()).collect();
        let platforms = selected
            .iter()
            .filter_map(|d| d.platform.as_ref().map(|p| p.to_string()))
            .collect();

        let mut images = Vec::new();
        let mut indexes = Vec::new();
        let mut seen: HashSet<Digest> = HashSet::new();
        let mut queue: VecDeque<Descriptor> = selected.into_iter().collect();

        // Nested indexes are copied whole; the platform filter applies to
        // the root only
        while let Some(descriptor) = queue.pop_front() {
            if !seen.insert(descriptor.digest.clone()) {
                continue;
            }
            let child = fetcher.fetch_child(&reference, &descriptor).await?;
            match child.manifest {
                Manifest::Image(manifest) => images.push(PlannedImage {
                    raw: child.raw,
                    manifest,
                }),
                Manifest::List(nested) => {
                    indexes.push(PlannedIndex {
                        raw: child.raw,
                        children: nested.manifests.iter().map(|d| d.digest.clone()).collect(),
                    });
                    queue.extend(nested.manifests);
                }
            }
        }
        Ok(CopyPlan {
            root,
            root_children,
            images,
            indexes,
            platforms,
        })
    }

    async fn check_clobber(&self, dst: &ImageReference, digest: &Digest) -> Result<()> {
        if !self.options.no_clobber {
            return Ok(());
        }
        let Some(tag) = dst.tag() else {
            return Ok(());
        };
        match self
            .destination
            .manifest_digest(&dst.repository, tag)
            .await?
        {
            Some(existing) if existing != *digest => Err(RegistryError::ClobberRefused {
                reference: dst.to_string(),
                existing: existing.to_string(),
            }),
            Some(_) => {
                self.output
                    .detail(&format!("{} already points at {}", dst, digest.short()));
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// One job per unique blob digest across every planned image
    fn build_jobs(&self, src: &ImageReference, dst: &ImageReference, plan: &CopyPlan) -> Vec<TransferJob> {
        let mut seen = HashSet::new();
        plan.images
            .iter()
            .flat_map(|image| image.manifest.blobs())
            .filter(|descriptor| seen.insert(descriptor.digest.clone()))
            .map(|descriptor| TransferJob::new(descriptor.clone(), src.clone(), dst.clone()))
            .collect()
    }

    async fn run_jobs(&self, jobs: Vec<TransferJob>, cancel: &CancellationToken) -> Vec<TransferJob> {
        let scheduler = TransferScheduler::new(
            self.source.clone(),
            self.destination.clone(),
            self.output.clone(),
        )
        .with_concurrency(self.options.concurrency)
        .with_overwrite(self.options.overwrite)
        .with_presence_cache(Arc::new(PresenceCache::new()))
        .with_spool_dir(self.options.spool_dir.clone());

        self.output.subsection(&format!("Transferring {} blobs", jobs.len()));
        let mut jobs = scheduler.transfer(jobs, cancel).await;

        let mut backoff = self.options.retry_backoff;
        for round in 1..=self.options.retries {
            let retry: Vec<usize> = jobs
                .iter()
                .enumerate()
                .filter(|(_, job)| job.error().is_some_and(RegistryError::is_retryable))
                .map(|(index, _)| index)
                .collect();
            if retry.is_empty() || cancel.is_cancelled() {
                break;
            }

            self.output.warning(&format!(
                "Retrying {} failed blob transfers (round {}/{})",
                retry.len(),
                round,
                self.options.retries
            ));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff *= 2;

            let again = retry
                .iter()
                .map(|&index| {
                    let mut job = jobs[index].clone();
                    job.state = JobState::Pending;
                    job
                })
                .collect();
            let redone = scheduler.transfer(again, cancel).await;
            for (index, job) in retry.into_iter().zip(redone) {
                // A retry cancelled before dispatch keeps its earlier failure
                if job.state.is_terminal() {
                    jobs[index] = job;
                }
            }
        }
        jobs
    }

    /// Push manifests after the join barrier, children before parents
    async fn push_manifests(&self, dst: &ImageReference, plan: &CopyPlan, report: &mut CopyReport) -> Result<()> {
        let available: HashSet<&Digest> = report
            .jobs
            .iter()
            .filter(|job| job.state.is_ok())
            .map(|job| job.digest())
            .collect();
        let mut pushed: HashSet<Digest> = HashSet::new();

        // A single image is pushed only as the root below
        let images = if plan.root_children.is_empty() { &[][..] } else { &plan.images[..] };
        for image in images {
            if !image.manifest.blobs().all(|d| available.contains(&d.digest)) {
                self.output.warning(&format!(
                    "Not pushing manifest {}: blobs missing",
                    image.raw.digest.short()
                ));
                continue;
            }
            self.push_by_digest(dst, &image.raw).await?;
            pushed.insert(image.raw.digest.clone());
            report.manifests_pushed.push(image.raw.digest.clone());
        }

        // Indexes may reference each other, so push in passes until every
        // index whose children are all in place has been pushed
        let mut waiting: Vec<&PlannedIndex> = plan.indexes.iter().collect();
        loop {
            let (ready, blocked): (Vec<&PlannedIndex>, Vec<&PlannedIndex>) = waiting
                .into_iter()
                .partition(|index| index.children.iter().all(|d| pushed.contains(d)));
            waiting = blocked;
            if ready.is_empty() {
                break;
            }
            for index in ready {
                self.push_by_digest(dst, &index.raw).await?;
                pushed.insert(index.raw.digest.clone());
                report.manifests_pushed.push(index.raw.digest.clone());
            }
        }
        for index in &waiting {
            self.output.warning(&format!(
                "Not pushing index {}: entries missing",
                index.raw.digest.short()
            ));
        }

        if !report.is_complete() {
            return Ok(());
        }
        if let Some(missing) = plan.root_children.iter().find(|d| !pushed.contains(*d)) {
            self.output.warning(&format!(
                "Not pushing {}: entry {} was not pushed",
                dst,
                missing.short()
            ));
            return Ok(());
        }

        self.destination
            .put_manifest(&dst.repository, dst.reference(), &plan.root)
            .await?;
        report.manifests_pushed.push(plan.root.digest.clone());
        report.root_pushed = true;
        self.output.success(&format!(
            "Pushed {} ({})",
            dst,
            plan.root.digest
        ));
        Ok(())
    }

    async fn push_by_digest(&self, dst: &ImageReference, raw: &RawManifest) -> Result<()> {
        self.destination
            .put_manifest(&dst.repository, &raw.digest.to_string(), raw)
            .await
    }
}
