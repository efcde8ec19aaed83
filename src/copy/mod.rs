//! Registry-to-registry image copy

pub mod fetcher;
pub mod orchestrator;
pub mod report;
pub mod scheduler;

pub use fetcher::{FetchedManifest, ManifestFetcher};
pub use orchestrator::{CopyOptions, CopyOrchestrator, default_concurrency};
pub use report::{CopyReport, JobState, TransferJob};
pub use scheduler::{PresenceCache, TransferScheduler};
