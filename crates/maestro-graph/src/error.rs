//! Resolution errors.
//!
//! Both variants are configuration errors: no valid activation order
//! exists, resolution fails as a whole, and nothing activates.  A partial
//! order is never returned — downstream modules must not silently run
//! without their declared prerequisites.

/// A dependency reference that no loaded manifest satisfies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingRef {
    /// The module declaring the dependency.
    pub module: String,
    /// The dependency name nothing provides.
    pub requires: String,
}

impl std::fmt::Display for MissingRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.module, self.requires)
    }
}

/// Why a manifest set could not be resolved.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    /// The graph contains a dependency cycle.  `members` lists the full
    /// cycle in dependency order: each member depends on the next, and the
    /// last depends on the first.
    #[error("dependency cycle: {}", format_cycle(members))]
    Cycle { members: Vec<String> },

    /// One or more modules reference dependencies no loaded manifest
    /// satisfies.  Every dangling reference is listed.
    #[error("missing dependencies: {}", format_refs(references))]
    MissingDependency { references: Vec<MissingRef> },
}

fn format_cycle(members: &[String]) -> String {
    let mut out = members.join(" -> ");
    if let Some(first) = members.first() {
        out.push_str(" -> ");
        out.push_str(first);
    }
    out
}

fn format_refs(references: &[MissingRef]) -> String {
    references
        .iter()
        .map(MissingRef::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ResolveError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_display_closes_the_loop() {
        let err = ResolveError::Cycle {
            members: vec!["a".into(), "b".into(), "c".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> c -> a");
    }

    #[test]
    fn missing_display_lists_every_reference() {
        let err = ResolveError::MissingDependency {
            references: vec![
                MissingRef {
                    module: "x".into(),
                    requires: "y".into(),
                },
                MissingRef {
                    module: "x".into(),
                    requires: "z".into(),
                },
            ],
        };
        assert_eq!(err.to_string(), "missing dependencies: x -> y, x -> z");
    }
}
