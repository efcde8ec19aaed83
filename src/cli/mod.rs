//! Command line interface
//!
//! Binds flags and `PLUGIN_*` environment variables onto [`CopyConfig`]
//! and drives a single copy through [`Runner`].
//!
//! [`CopyConfig`]: crate::config::CopyConfig

pub mod args;
pub mod runner;

pub use args::Args;
pub use runner::Runner;
