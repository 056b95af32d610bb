//! Module manifest loading for Maestro.
//!
//! A module declares its identity, offered capabilities, and auth/module
//! dependencies in a `module.toml` file.  This crate parses those files,
//! validates them structurally, and keeps the loaded set consistent
//! (unique names, one provider per capability) for the dependency
//! resolver to consume.

pub mod error;
pub mod manifest;
pub mod registry;

// Re-export the most commonly used types at the crate root for convenience.
pub use error::{ManifestError, Result};
pub use manifest::{
    AuthDependency, Dependencies, ExecSpec, MANIFEST_FILE, ModuleManifest, default_profile,
};
pub use registry::{LoadReport, ManifestRegistry};
