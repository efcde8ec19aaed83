//! Registry API operations grouped by resource

pub mod blob_operations;
pub mod manifest_operations;

pub use blob_operations::BlobOperations;
pub use manifest_operations::ManifestOperations;
