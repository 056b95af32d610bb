//! Orchestrator error types.
//!
//! Only configuration-level failures surface as `Err` from the
//! orchestrator: a resolution error means no valid activation order exists
//! and nothing activates.  Per-module failures (credentials, process
//! start) are recorded against the module's activation record instead and
//! never abort the run.

/// Unified error type for the Maestro orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// A requested module has no loaded manifest.
    #[error("module not loaded: `{name}`")]
    ModuleNotLoaded { name: String },

    /// The manifest set could not be resolved (cycle or missing
    /// dependency).  Always reported before any activation attempt.
    #[error(transparent)]
    Resolve(#[from] maestro_graph::ResolveError),

    /// Catch-all for unexpected internal errors.
    #[error("internal orchestrator error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
