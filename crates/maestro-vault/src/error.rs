//! Vault error types.
//!
//! All vault subsystems surface errors through [`VaultError`], the single
//! error type returned by every public API in this crate.  Callers are
//! expected to match on variants rather than inspect strings: `NotFound`,
//! `CorruptRecord`, and `KeyUnavailable` each demand a different response
//! (re-authenticate, quarantine review, abort) and must stay distinguishable.

/// Unified error type for the Maestro credential vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    // -- Crypto errors ------------------------------------------------------
    /// Encryption failed (e.g. invalid key length, ring internal error).
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// Decryption failed before a record could be attributed — wrong key
    /// length, CSPRNG failure, and similar.  Tamper/authentication failures
    /// on a stored record surface as [`VaultError::CorruptRecord`] instead.
    #[error("decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    /// Key derivation failed (e.g. salt generation).
    #[error("key derivation failed: {reason}")]
    KeyDerivationFailed { reason: String },

    // -- Master key errors --------------------------------------------------
    /// The master key is missing or cannot be unlocked.  Fatal for the whole
    /// vault, not per-record.
    #[error("master key unavailable: {reason}")]
    KeyUnavailable { reason: String },

    // -- Record errors ------------------------------------------------------
    /// No active credential exists for the given (provider, profile).
    #[error("credential not found: provider={provider}, profile={profile}")]
    NotFound { provider: String, profile: String },

    /// A stored record failed AEAD authentication on read.  The record has
    /// been quarantined (never auto-deleted) and needs operator attention.
    #[error("corrupt credential record: provider={provider}, profile={profile}")]
    CorruptRecord { provider: String, profile: String },

    /// Database schema migration failed.
    #[error("migration failed: {reason}")]
    MigrationFailed { reason: String },

    // -- Underlying errors --------------------------------------------------
    /// SQLite error from `rusqlite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from the filesystem (key file operations, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors.  Prefer a typed variant
    /// whenever possible.
    #[error("internal vault error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the vault crate.
pub type Result<T> = std::result::Result<T, VaultError>;
