//! Per-module activation state.
//!
//! # Module lifecycle
//!
//! ```text
//! Unresolved --> Pending --> Activating --> Active --> Deactivated
//!                                      \--> Failed
//! ```
//!
//! `Unresolved` is a module known to the registry but not part of any
//! accepted activation run.  `Pending` means the graph accepted it;
//! `Activating` means dependencies are satisfied and credentials are being
//! fetched.  A `Failed` record carries the error; an activation record
//! only ever references injected credentials by vault record id, never by
//! value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use maestro_vault::RecordId;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a module within an activation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    /// Known to the registry, not part of an accepted run.
    Unresolved,
    /// The dependency graph accepted this module for the current run.
    Pending,
    /// Dependencies satisfied; credentials being fetched / process starting.
    Activating,
    /// Running with injected credentials.
    Active,
    /// Activation failed; see the record's error.
    Failed,
    /// Shut down (normal deactivation or post-abort cleanup).
    Deactivated,
}

impl ModuleState {
    /// Whether the state is terminal for scheduling purposes: dependents of
    /// a terminal module may proceed (or fail) without waiting further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Active | Self::Failed | Self::Deactivated)
    }
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unresolved => "unresolved",
            Self::Pending => "pending",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Deactivated => "deactivated",
        };
        f.write_str(s)
    }
}

/// Why a module failed to activate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivationError {
    /// A required credential was unobtainable (not stored, expired and
    /// unrefreshable, insufficient scope, corrupt, or fetch timeout).
    /// Recoverable by re-authenticating and re-running.
    Credential {
        provider: String,
        profile: String,
        reason: String,
    },

    /// An ancestor failed, so this module never started.  Always traces
    /// back to one root cause.
    DependencyFailed { dependency: String },

    /// The module process could not be started or never signalled ready.
    Exec { reason: String },
}

impl std::fmt::Display for ActivationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Credential {
                provider,
                profile,
                reason,
            } => write!(f, "credential error ({provider}/{profile}): {reason}"),
            Self::DependencyFailed { dependency } => {
                write!(f, "dependency failed: {dependency}")
            }
            Self::Exec { reason } => write!(f, "exec error: {reason}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Runtime state of one module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRecord {
    /// The module name.
    pub module: String,

    /// Current lifecycle state.
    pub state: ModuleState,

    /// The last error, when `state` is `Failed`.
    pub error: Option<ActivationError>,

    /// Vault record ids of the credentials injected at activation time.
    /// Handles only — plaintext secrets never appear here.
    pub credential_refs: Vec<RecordId>,

    /// When activation began.
    pub started_at: Option<DateTime<Utc>>,

    /// When the module reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl ActivationRecord {
    /// A fresh record in the given state.
    pub fn new(module: impl Into<String>, state: ModuleState) -> Self {
        Self {
            module: module.into(),
            state,
            error: None,
            credential_refs: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Snapshot of one activation run: every selected module's terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Records sorted by module name.
    pub records: Vec<ActivationRecord>,

    /// Whether the run was aborted by the caller.
    pub aborted: bool,

    /// When the snapshot was taken.
    pub completed_at: DateTime<Utc>,
}

impl RunReport {
    /// The record for a module, if it was part of the run.
    pub fn get(&self, module: &str) -> Option<&ActivationRecord> {
        self.records.iter().find(|r| r.module == module)
    }

    /// Whether every module in the run reached `Active`.
    pub fn all_active(&self) -> bool {
        self.records
            .iter()
            .all(|r| r.state == ModuleState::Active)
    }

    /// Process exit code for this run: 0 when everything requested is
    /// active, 1 when one or more modules failed.  (Resolution errors exit
    /// 2 before a report ever exists.)
    pub fn exit_code(&self) -> i32 {
        if self
            .records
            .iter()
            .any(|r| r.state == ModuleState::Failed)
        {
            1
        } else {
            0
        }
    }

    /// Trace a failed module back to the root cause of its cascade.
    ///
    /// For a `DependencyFailed` chain this follows the chain to the module
    /// that actually failed and returns `(root_module, root_error)`; for a
    /// directly failed module it returns the module itself.
    pub fn root_cause(&self, module: &str) -> Option<(&str, &ActivationError)> {
        let mut current = self.get(module)?;
        // Bounded by record count; a cycle here would mean the resolver
        // accepted a cyclic graph.
        for _ in 0..=self.records.len() {
            match current.error.as_ref()? {
                ActivationError::DependencyFailed { dependency } => {
                    current = self.get(dependency)?;
                }
                error => return Some((current.module.as_str(), error)),
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(module: &str, error: ActivationError) -> ActivationRecord {
        let mut record = ActivationRecord::new(module, ModuleState::Failed);
        record.error = Some(error);
        record
    }

    fn report(records: Vec<ActivationRecord>) -> RunReport {
        RunReport {
            records,
            aborted: false,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn terminal_states() {
        assert!(ModuleState::Active.is_terminal());
        assert!(ModuleState::Failed.is_terminal());
        assert!(ModuleState::Deactivated.is_terminal());
        assert!(!ModuleState::Pending.is_terminal());
        assert!(!ModuleState::Activating.is_terminal());
        assert!(!ModuleState::Unresolved.is_terminal());
    }

    #[test]
    fn exit_code_zero_when_all_active() {
        let report = report(vec![
            ActivationRecord::new("a", ModuleState::Active),
            ActivationRecord::new("b", ModuleState::Active),
        ]);
        assert!(report.all_active());
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn exit_code_one_on_any_failure() {
        let report = report(vec![
            ActivationRecord::new("a", ModuleState::Active),
            failed(
                "b",
                ActivationError::Exec {
                    reason: "spawn failed".into(),
                },
            ),
        ]);
        assert!(!report.all_active());
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn root_cause_follows_dependency_chain() {
        let report = report(vec![
            failed(
                "base",
                ActivationError::Credential {
                    provider: "google".into(),
                    profile: "default".into(),
                    reason: "no credential stored".into(),
                },
            ),
            failed(
                "mid",
                ActivationError::DependencyFailed {
                    dependency: "base".into(),
                },
            ),
            failed(
                "top",
                ActivationError::DependencyFailed {
                    dependency: "mid".into(),
                },
            ),
        ]);

        let (root, error) = report.root_cause("top").unwrap();
        assert_eq!(root, "base");
        assert!(matches!(error, ActivationError::Credential { .. }));

        // A directly failed module is its own root cause.
        let (root, _) = report.root_cause("base").unwrap();
        assert_eq!(root, "base");
    }

    #[test]
    fn root_cause_of_active_module_is_none() {
        let report = report(vec![ActivationRecord::new("a", ModuleState::Active)]);
        assert!(report.root_cause("a").is_none());
        assert!(report.root_cause("unknown").is_none());
    }

    #[test]
    fn report_serializes_for_status_snapshot() {
        let report = report(vec![failed(
            "b",
            ActivationError::DependencyFailed {
                dependency: "a".into(),
            },
        )]);
        let json = serde_json::to_string(&report).unwrap();
        let back: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.records.len(), 1);
        assert_eq!(back.records[0].state, ModuleState::Failed);
        assert!(matches!(
            back.records[0].error,
            Some(ActivationError::DependencyFailed { .. })
        ));
    }
}
