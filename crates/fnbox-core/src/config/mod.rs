//! Configuration module for the execution engine
//!
//! YAML configuration with per-field defaults and `FNBOX_*` environment
//! overrides.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;
