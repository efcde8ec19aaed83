//! Image model: references, manifests and platform selection
//!
//! These types are pure data. Nothing in this module talks to a registry.

pub mod manifest;
pub mod platform;
pub mod reference;

pub use manifest::{
    Descriptor, ImageManifest, Manifest, ManifestList, ManifestType, Platform, RawManifest,
};
pub use platform::{PlatformSpec, filter};
pub use reference::ImageReference;
