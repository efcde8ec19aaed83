//! Docker Image Copier Library
//!
//! Copies container images between OCI-compliant registries: multi-platform
//! manifest lists are fanned out, blobs are deduplicated by digest and
//! verified before upload, and manifests are pushed byte-for-byte so the
//! destination digest equals the source digest.
//!
//! The entry point for library users is [`CopyOrchestrator`]; the binary
//! wraps it in [`cli::Runner`].

pub mod cli;
pub mod config;
pub mod copy;
pub mod digest;
pub mod error;
pub mod image;
pub mod logging;
pub mod output;
pub mod registry;

pub use config::CopyConfig;
pub use copy::{CopyOptions, CopyOrchestrator, CopyReport};
pub use digest::Digest;
pub use error::{RegistryError, Result};
pub use image::{ImageReference, PlatformSpec};
pub use logging::{LogLevel, Logger};
pub use registry::{MemoryRegistry, Registry, RegistryClient};
