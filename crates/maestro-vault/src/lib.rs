//! Encrypted credential vault for Maestro.
//!
//! This crate stores secrets (OAuth token pairs, API keys, basic-auth
//! pairs) for multiple external providers, with multiple named profiles per
//! provider.  All payloads are sealed with AES-256-GCM under a process-wide
//! master key before reaching storage, every access is recorded in an
//! append-only audit log, and at most one active record exists per
//! (provider, profile) at any point.
//!
//! # Modules
//!
//! - [`crypto`] — AES-256-GCM sealing, PBKDF2 key derivation, [`crypto::MasterKey`].
//! - [`keyfile`] — master key generation, persistence, and unlock.
//! - [`store`] — SQLite-backed encrypted record store with supersede semantics.
//! - [`audit`] — append-only access log.
//! - [`secret`] — redacting secret wrappers and payload types.
//! - [`error`] — unified error type.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use maestro_vault::keyfile::MasterKeyFile;
//! use maestro_vault::secret::{Secret, SecretPayload};
//! use maestro_vault::store::Vault;
//!
//! # fn example() -> maestro_vault::error::Result<()> {
//! let keyfile = MasterKeyFile::new("data/master.key");
//! let master = keyfile.load_or_init(None)?;
//!
//! let vault = Vault::open("data/vault.db", master)?;
//! vault.put(
//!     "cli",
//!     "stripe",
//!     "default",
//!     &SecretPayload::ApiKey { key: Secret::new("sk-live-...") },
//!     &[],
//!     None,
//! )?;
//!
//! let cred = vault.get("cli", "stripe", "default")?;
//! let _token = cred.payload.bearer_secret().expose();
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod crypto;
pub mod error;
pub mod keyfile;
pub mod secret;
pub mod store;

// Re-export the most commonly used types at the crate root for convenience.
pub use audit::{AuditEntry, AuditLog, AuditOp, AuditOutcome};
pub use crypto::MasterKey;
pub use error::{Result, VaultError};
pub use keyfile::MasterKeyFile;
pub use secret::{CredentialKind, Secret, SecretPayload};
pub use store::{Credential, CredentialHealth, CredentialSummary, RecordId, RecordState, Vault};
