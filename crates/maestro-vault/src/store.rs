//! SQLite-backed encrypted credential store.
//!
//! The [`Vault`] wraps a `rusqlite::Connection` and the process-wide master
//! key.  Every payload is sealed with AES-256-GCM before it reaches SQLite
//! and opened only in memory on read.
//!
//! # Schema
//!
//! - `credentials` — sealed credential blobs keyed by (provider, profile).
//!   A partial unique index enforces at most one `active` row per key.
//! - `audit_log` — append-only record of every access (see [`crate::audit`]).
//!
//! Schema migration is automatic on [`Vault::open`].
//!
//! # Concurrency
//!
//! Access is serialized per (provider, profile) through a lock map, so a
//! supersede on one key never contends with reads of an unrelated provider
//! beyond the brief connection borrow.  The master key is read-only except
//! during [`Vault::rotate_master_key`].

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{self, AuditOp, AuditOutcome};
use crate::crypto::{self, MasterKey, SealedBlob};
use crate::error::{Result, VaultError};
use crate::secret::{CredentialKind, SecretPayload};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Unique, time-ordered credential record identifier (UUID v7).
pub type RecordId = Uuid;

/// Lifecycle state of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// The one live record for its (provider, profile).
    Active,
    /// Superseded by a newer put, or explicitly revoked.
    Revoked,
    /// Refresh was definitively rejected; re-authentication required.
    Failed,
    /// Failed AEAD authentication on read; kept for inspection.
    Quarantined,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Revoked => "revoked",
            Self::Failed => "failed",
            Self::Quarantined => "quarantined",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "revoked" => Some(Self::Revoked),
            "failed" => Some(Self::Failed),
            "quarantined" => Some(Self::Quarantined),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decrypted credential as returned by [`Vault::get`].
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: RecordId,
    pub provider: String,
    pub profile: String,
    pub kind: CredentialKind,
    /// The decrypted payload.  Redacted in Debug output.
    pub payload: SecretPayload,
    /// Scopes granted when the credential was issued.
    pub scopes: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Summary of a stored record without its payload — listing never decrypts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSummary {
    pub id: RecordId,
    pub provider: String,
    pub profile: String,
    pub kind: CredentialKind,
    pub state: RecordState,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Health of the active record for a (provider, profile).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialHealth {
    /// Whether an active, unexpired record exists.
    pub valid: bool,
    /// Days until expiry, when an expiry is recorded.  Zero means the
    /// record expires today (or already has).
    pub expires_in_days: Option<i64>,
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// Encrypted credential vault backed by SQLite.
///
/// `Send + Sync`: the connection sits behind a `Mutex`, per-key ordering is
/// enforced by the lock map, and the master key behind an `RwLock` that is
/// only written during rotation.
pub struct Vault {
    conn: Mutex<Connection>,
    master_key: RwLock<MasterKey>,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Vault {
    /// Open (or create) a vault database at `path` with the given master
    /// key.  Runs schema migrations automatically.
    pub fn open(path: impl AsRef<std::path::Path>, master_key: MasterKey) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "opening vault database");

        let conn = Connection::open(path)?;
        Self::configure_connection(&conn)?;

        let vault = Self {
            conn: Mutex::new(conn),
            master_key: RwLock::new(master_key),
            key_locks: DashMap::new(),
        };
        vault.run_migrations()?;

        tracing::info!("vault database ready");
        Ok(vault)
    }

    /// Open an in-memory vault (useful for testing).
    pub fn open_in_memory(master_key: MasterKey) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure_connection(&conn)?;

        let vault = Self {
            conn: Mutex::new(conn),
            master_key: RwLock::new(master_key),
            key_locks: DashMap::new(),
        };
        vault.run_migrations()?;
        Ok(vault)
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA temp_store = MEMORY;",
        )?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        tracing::debug!("running vault schema migrations");

        self.conn()?
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS credentials (
                id         TEXT PRIMARY KEY,
                provider   TEXT NOT NULL,
                profile    TEXT NOT NULL,
                kind       TEXT NOT NULL CHECK(kind IN ('oauth','api_key','basic')),
                payload    BLOB NOT NULL,
                nonce      BLOB NOT NULL,
                scopes     TEXT NOT NULL DEFAULT '[]',
                issued_at  INTEGER NOT NULL,
                expires_at INTEGER,
                state      TEXT NOT NULL DEFAULT 'active'
                           CHECK(state IN ('active','revoked','failed','quarantined')),
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_credentials_key
                ON credentials(provider, profile);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_credentials_one_active
                ON credentials(provider, profile) WHERE state = 'active';

            CREATE TABLE IF NOT EXISTS audit_log (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                actor     TEXT NOT NULL,
                provider  TEXT NOT NULL,
                profile   TEXT NOT NULL,
                operation TEXT NOT NULL,
                outcome   TEXT NOT NULL,
                detail    TEXT,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);",
            )
            .map_err(|e| VaultError::MigrationFailed {
                reason: e.to_string(),
            })?;

        tracing::debug!("vault schema migrations complete");
        Ok(())
    }

    // -- Credential operations ----------------------------------------------

    /// Store a credential, superseding any previous active record for the
    /// same (provider, profile).
    ///
    /// The revoke of the old record and the insert of the new one happen in
    /// a single transaction: there is no window where two active records
    /// exist, and concurrent puts linearize to last-writer-wins.
    pub fn put(
        &self,
        actor: &str,
        provider: &str,
        profile: &str,
        payload: &SecretPayload,
        scopes: &[String],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<RecordId> {
        let key_lock = self.key_lock(provider, profile);
        let _key_guard = lock_key(&key_lock)?;

        let id = Uuid::now_v7();
        let now = Utc::now().timestamp();
        let plaintext = serde_json::to_vec(payload)?;
        let scopes_json = serde_json::to_string(scopes)?;
        let expires_ts = expires_at.map(|e| e.timestamp());
        let kind = payload.kind();

        let mut conn = self.conn()?;
        let blob = {
            let key = self.master_key()?;
            crypto::seal(&plaintext, &key)?
        };

        let tx = conn.transaction()?;
        let superseded = tx.execute(
            "UPDATE credentials SET state = 'revoked', updated_at = ?1
             WHERE provider = ?2 AND profile = ?3 AND state = 'active'",
            params![now, provider, profile],
        )?;
        tx.execute(
            "INSERT INTO credentials
                (id, provider, profile, kind, payload, nonce, scopes, issued_at, expires_at,
                 state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'active', ?10, ?11)",
            params![
                id.to_string(),
                provider,
                profile,
                kind.as_str(),
                blob.ciphertext,
                blob.nonce.as_slice(),
                scopes_json,
                now,
                expires_ts,
                now,
                now,
            ],
        )?;
        audit::append(
            &tx,
            actor,
            provider,
            profile,
            AuditOp::Put,
            AuditOutcome::Ok,
            Some(kind.as_str()),
        )?;
        tx.commit()?;

        tracing::info!(
            provider = provider,
            profile = profile,
            kind = %kind,
            superseded = superseded,
            "stored credential"
        );
        Ok(id)
    }

    /// Retrieve and decrypt the active credential for (provider, profile).
    ///
    /// Every call appends an audit entry, success or not.  A record that
    /// fails AEAD authentication is quarantined in place and surfaced as
    /// [`VaultError::CorruptRecord`]; it is never auto-deleted.
    pub fn get(&self, actor: &str, provider: &str, profile: &str) -> Result<Credential> {
        let key_lock = self.key_lock(provider, profile);
        let _key_guard = lock_key(&key_lock)?;

        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, kind, payload, nonce, scopes, issued_at, expires_at
                 FROM credentials
                 WHERE provider = ?1 AND profile = ?2 AND state = 'active'",
                params![provider, profile],
                |row| {
                    Ok(RecordRow {
                        id: row.get(0)?,
                        kind: row.get(1)?,
                        payload: row.get(2)?,
                        nonce: row.get(3)?,
                        scopes: row.get(4)?,
                        issued_at: row.get(5)?,
                        expires_at: row.get(6)?,
                    })
                },
            )
            .optional()?;

        let Some(row) = row else {
            audit::append(
                &conn,
                actor,
                provider,
                profile,
                AuditOp::Get,
                AuditOutcome::NotFound,
                None,
            )?;
            return Err(VaultError::NotFound {
                provider: provider.to_string(),
                profile: profile.to_string(),
            });
        };

        match self.open_row(&row) {
            Ok(payload) => {
                audit::append(
                    &conn,
                    actor,
                    provider,
                    profile,
                    AuditOp::Get,
                    AuditOutcome::Ok,
                    None,
                )?;

                let scopes: Vec<String> = serde_json::from_str(&row.scopes)
                    .map_err(|e| VaultError::Internal(format!("bad scopes JSON: {e}")))?;

                Ok(Credential {
                    id: parse_record_id(&row.id)?,
                    provider: provider.to_string(),
                    profile: profile.to_string(),
                    kind: CredentialKind::parse(&row.kind).unwrap_or(CredentialKind::ApiKey),
                    payload,
                    scopes,
                    issued_at: DateTime::from_timestamp(row.issued_at, 0).unwrap_or_default(),
                    expires_at: row.expires_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
                })
            }
            Err(_) => {
                // Quarantine in place; the ciphertext stays for inspection.
                conn.execute(
                    "UPDATE credentials SET state = 'quarantined', updated_at = ?1 WHERE id = ?2",
                    params![Utc::now().timestamp(), row.id],
                )?;
                audit::append(
                    &conn,
                    actor,
                    provider,
                    profile,
                    AuditOp::Get,
                    AuditOutcome::Corrupt,
                    None,
                )?;
                tracing::error!(
                    provider = provider,
                    profile = profile,
                    "credential record failed authentication, quarantined"
                );
                Err(VaultError::CorruptRecord {
                    provider: provider.to_string(),
                    profile: profile.to_string(),
                })
            }
        }
    }

    /// Revoke the active credential for (provider, profile).
    pub fn revoke(&self, actor: &str, provider: &str, profile: &str) -> Result<()> {
        self.transition(actor, provider, profile, RecordState::Revoked, AuditOp::Revoke)
    }

    /// Mark the active credential failed (definitive refresh rejection).
    /// The record stays readable via listings but `get` no longer returns
    /// it; re-authentication creates a fresh record.
    pub fn mark_failed(&self, actor: &str, provider: &str, profile: &str) -> Result<()> {
        self.transition(
            actor,
            provider,
            profile,
            RecordState::Failed,
            AuditOp::MarkFailed,
        )
    }

    fn transition(
        &self,
        actor: &str,
        provider: &str,
        profile: &str,
        to: RecordState,
        op: AuditOp,
    ) -> Result<()> {
        let key_lock = self.key_lock(provider, profile);
        let _key_guard = lock_key(&key_lock)?;

        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE credentials SET state = ?1, updated_at = ?2
             WHERE provider = ?3 AND profile = ?4 AND state = 'active'",
            params![to.as_str(), Utc::now().timestamp(), provider, profile],
        )?;

        if rows == 0 {
            audit::append(
                &conn,
                actor,
                provider,
                profile,
                op,
                AuditOutcome::NotFound,
                None,
            )?;
            return Err(VaultError::NotFound {
                provider: provider.to_string(),
                profile: profile.to_string(),
            });
        }

        audit::append(&conn, actor, provider, profile, op, AuditOutcome::Ok, None)?;
        tracing::info!(provider = provider, profile = profile, state = %to, "credential state changed");
        Ok(())
    }

    /// List the active records for a provider, ordered by profile.  Never
    /// decrypts.
    pub fn list(&self, provider: &str) -> Result<Vec<CredentialSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, provider, profile, kind, state, scopes, expires_at, updated_at
             FROM credentials
             WHERE provider = ?1 AND state = 'active'
             ORDER BY profile",
        )?;
        let rows = stmt.query_map(params![provider], summary_from_row)?;
        collect_summaries(rows)
    }

    /// Every provider that currently has at least one active record.
    pub fn providers(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT provider FROM credentials WHERE state = 'active' ORDER BY provider",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut providers = Vec::new();
        for row in rows {
            providers.push(row?);
        }
        Ok(providers)
    }

    /// Health of the active record for (provider, profile).  A missing
    /// record reports `valid: false` rather than an error — health checks
    /// are not accesses.
    pub fn health(&self, provider: &str, profile: &str) -> Result<CredentialHealth> {
        let conn = self.conn()?;
        let expires_at: Option<Option<i64>> = conn
            .query_row(
                "SELECT expires_at FROM credentials
                 WHERE provider = ?1 AND profile = ?2 AND state = 'active'",
                params![provider, profile],
                |row| row.get(0),
            )
            .optional()?;

        let Some(expires_ts) = expires_at else {
            return Ok(CredentialHealth {
                valid: false,
                expires_in_days: None,
            });
        };

        let now = Utc::now().timestamp();
        let (valid, expires_in_days) = match expires_ts {
            Some(ts) => (ts > now, Some(((ts - now).max(0)) / 86_400)),
            None => (true, None),
        };

        Ok(CredentialHealth {
            valid,
            expires_in_days,
        })
    }

    /// Re-encrypt every non-quarantined record under `new_key` and make it
    /// the vault's master key.  All-or-nothing: a single failed re-seal
    /// rolls the whole transaction back and leaves the old key in place.
    ///
    /// Returns the number of re-encrypted records.  Quarantined rows cannot
    /// be opened and are left untouched.
    pub fn rotate_master_key(&self, actor: &str, new_key: &MasterKey) -> Result<usize> {
        let mut conn = self.conn()?;
        let mut master = self
            .master_key
            .write()
            .map_err(|_| VaultError::Internal("master key lock poisoned".into()))?;

        let tx = conn.transaction()?;
        let rows: Vec<(String, Vec<u8>, Vec<u8>)> = {
            let mut stmt = tx.prepare(
                "SELECT id, payload, nonce FROM credentials WHERE state != 'quarantined'",
            )?;
            let mapped = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?;
            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row?);
            }
            rows
        };

        let now = Utc::now().timestamp();
        for (id, ciphertext, nonce_bytes) in &rows {
            let nonce = nonce_array(nonce_bytes)?;
            let plaintext = crypto::open(
                &SealedBlob {
                    nonce,
                    ciphertext: ciphertext.clone(),
                },
                &master,
            )?;
            let resealed = crypto::seal(&plaintext, new_key)?;
            tx.execute(
                "UPDATE credentials SET payload = ?1, nonce = ?2, updated_at = ?3 WHERE id = ?4",
                params![resealed.ciphertext, resealed.nonce.as_slice(), now, id],
            )?;
        }

        audit::append(
            &tx,
            actor,
            "*",
            "*",
            AuditOp::Rotate,
            AuditOutcome::Ok,
            Some(&format!("records={}", rows.len())),
        )?;
        tx.commit()?;

        *master = new_key.clone();
        tracing::info!(records = rows.len(), "master key rotated");
        Ok(rows.len())
    }

    // -- Internal helpers ---------------------------------------------------

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| VaultError::Internal("connection lock poisoned".into()))
    }

    fn master_key(&self) -> Result<std::sync::RwLockReadGuard<'_, MasterKey>> {
        self.master_key
            .read()
            .map_err(|_| VaultError::Internal("master key lock poisoned".into()))
    }

    fn key_lock(&self, provider: &str, profile: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(format!("{provider}/{profile}"))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Decrypt a row's payload.  Any failure here means the record cannot
    /// be authenticated under the current master key.
    fn open_row(&self, row: &RecordRow) -> Result<SecretPayload> {
        let nonce = nonce_array(&row.nonce)?;
        let key = self.master_key()?;
        let plaintext = crypto::open(
            &SealedBlob {
                nonce,
                ciphertext: row.payload.clone(),
            },
            &key,
        )?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

// ---------------------------------------------------------------------------
// Internal row plumbing
// ---------------------------------------------------------------------------

struct RecordRow {
    id: String,
    kind: String,
    payload: Vec<u8>,
    nonce: Vec<u8>,
    scopes: String,
    issued_at: i64,
    expires_at: Option<i64>,
}

fn nonce_array(bytes: &[u8]) -> Result<[u8; crypto::NONCE_LEN_BYTES]> {
    if bytes.len() != crypto::NONCE_LEN_BYTES {
        return Err(VaultError::DecryptionFailed {
            reason: format!(
                "stored nonce is {} bytes, expected {}",
                bytes.len(),
                crypto::NONCE_LEN_BYTES
            ),
        });
    }
    let mut nonce = [0u8; crypto::NONCE_LEN_BYTES];
    nonce.copy_from_slice(bytes);
    Ok(nonce)
}

fn parse_record_id(raw: &str) -> Result<RecordId> {
    Uuid::parse_str(raw).map_err(|e| VaultError::Internal(format!("bad record id: {e}")))
}

type SummaryRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<i64>,
    i64,
);

fn summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SummaryRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn collect_summaries(
    rows: impl Iterator<Item = rusqlite::Result<SummaryRow>>,
) -> Result<Vec<CredentialSummary>> {
    let mut summaries = Vec::new();
    for row in rows {
        let (id, provider, profile, kind, state, scopes, expires_at, updated_at) = row?;
        summaries.push(CredentialSummary {
            id: parse_record_id(&id)?,
            provider,
            profile,
            kind: CredentialKind::parse(&kind).unwrap_or(CredentialKind::ApiKey),
            state: RecordState::parse(&state).unwrap_or(RecordState::Revoked),
            scopes: serde_json::from_str(&scopes)
                .map_err(|e| VaultError::Internal(format!("bad scopes JSON: {e}")))?,
            expires_at: expires_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            updated_at: DateTime::from_timestamp(updated_at, 0).unwrap_or_default(),
        });
    }
    Ok(summaries)
}

fn lock_key(lock: &Arc<Mutex<()>>) -> Result<MutexGuard<'_, ()>> {
    lock.lock()
        .map_err(|_| VaultError::Internal("key lock poisoned".into()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
