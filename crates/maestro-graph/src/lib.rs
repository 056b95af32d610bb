//! Dependency resolution for Maestro modules.
//!
//! Builds a directed graph from loaded manifests, rejects cycles and
//! dangling references outright (no partial orders), and produces a
//! deterministic activation order plus the adjacency the orchestrator
//! schedules against.

pub mod error;
pub mod graph;

// Re-export the most commonly used types at the crate root for convenience.
pub use error::{MissingRef, ResolveError, Result};
pub use graph::{ActivationOrder, DependencyGraph, resolve};
