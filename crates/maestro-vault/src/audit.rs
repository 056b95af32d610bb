//! Append-only audit log.
//!
//! Every credential access — who asked, which record, what happened — is
//! recorded in the `audit_log` table.  The table is strictly append-only:
//! no update or delete path exists anywhere in this crate, and entries are
//! retained for the life of the vault.  Secret material never reaches the
//! log; entries carry only identifiers and outcomes.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::Vault;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The vault operation an audit entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOp {
    Put,
    Get,
    Revoke,
    MarkFailed,
    Rotate,
}

impl AuditOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Get => "get",
            Self::Revoke => "revoke",
            Self::MarkFailed => "mark_failed",
            Self::Rotate => "rotate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "put" => Some(Self::Put),
            "get" => Some(Self::Get),
            "revoke" => Some(Self::Revoke),
            "mark_failed" => Some(Self::MarkFailed),
            "rotate" => Some(Self::Rotate),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the audited operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The operation succeeded.
    Ok,
    /// No matching active record existed.
    NotFound,
    /// The record failed authentication and was quarantined.
    Corrupt,
    /// The operation failed for another reason (detail carries context).
    Error,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NotFound => "not_found",
            Self::Corrupt => "corrupt",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Self::Ok),
            "not_found" => Some(Self::NotFound),
            "corrupt" => Some(Self::Corrupt),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Database row ID (monotonically increasing).
    pub id: i64,

    /// Who or what performed the access (e.g. "cli", a module name).
    pub actor: String,

    /// The provider involved ("*" for vault-wide operations).
    pub provider: String,

    /// The profile involved ("*" for vault-wide operations).
    pub profile: String,

    /// The operation performed.
    pub operation: AuditOp,

    /// How it ended.
    pub outcome: AuditOutcome,

    /// Additional non-secret context.
    pub detail: Option<String>,

    /// When the access occurred.
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Writing (crate-internal)
// ---------------------------------------------------------------------------

/// Append one entry.  Called by the store inside the same transaction (or
/// connection guard) as the operation it describes.
pub(crate) fn append(
    conn: &Connection,
    actor: &str,
    provider: &str,
    profile: &str,
    operation: AuditOp,
    outcome: AuditOutcome,
    detail: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_log (actor, provider, profile, operation, outcome, detail, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            actor,
            provider,
            profile,
            operation.as_str(),
            outcome.as_str(),
            detail,
            Utc::now().timestamp(),
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Read-only view over the vault's audit log.
pub struct AuditLog<'a> {
    vault: &'a Vault,
}

impl<'a> AuditLog<'a> {
    /// Create an audit log reader over the given vault.
    pub fn new(vault: &'a Vault) -> Self {
        Self { vault }
    }

    /// The most recent `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let conn = self.vault.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, actor, provider, profile, operation, outcome, detail, timestamp
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, actor, provider, profile, op, outcome, detail, ts) = row?;
            entries.push(AuditEntry {
                id,
                actor,
                provider,
                profile,
                operation: AuditOp::parse(&op).unwrap_or(AuditOp::Get),
                outcome: AuditOutcome::parse(&outcome).unwrap_or(AuditOutcome::Error),
                detail,
                timestamp: DateTime::from_timestamp(ts, 0).unwrap_or_default(),
            });
        }
        Ok(entries)
    }

    /// Total number of entries ever written.
    pub fn count(&self) -> Result<i64> {
        let conn = self.vault.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
