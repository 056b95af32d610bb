//! Error types for the manifest subsystem.
//!
//! Manifest validation failures are structural and always fatal for the one
//! manifest concerned; loading of sibling manifests continues.

use std::path::PathBuf;

/// Manifest-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("module not found: `{0}`")]
    NotFound(String),

    #[error("invalid manifest in `{path}`: {reason}")]
    InvalidFormat { path: PathBuf, reason: String },

    #[error("missing or empty required field `{field}` in `{path}`")]
    MissingField { path: PathBuf, field: String },

    #[error("invalid module name `{name}`: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("module `{name}` declares a dependency on itself")]
    SelfDependency { name: String },

    #[error("module `{name}` is already loaded")]
    DuplicateModule { name: String },

    #[error(
        "capability `{capability}` declared by `{module}` is already provided by `{claimed_by}`"
    )]
    CapabilityCollision {
        capability: String,
        module: String,
        claimed_by: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ManifestError>;
