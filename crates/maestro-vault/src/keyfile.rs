//! Master key storage on disk.
//!
//! The process-wide master key is generated once at first use and persisted
//! encrypted — never as plaintext.  The wrapping key is derived with PBKDF2
//! from either a user passphrase or, when none is supplied, machine-specific
//! material (hostname + username + application salt).
//!
//! Key file layout (binary):
//! ```text
//! [32 bytes: PBKDF2 salt]
//! [12 bytes: AES-256-GCM nonce]
//! [remaining: AES-256-GCM ciphertext + 16-byte tag]
//! ```
//!
//! The file is written with mode 0600 on Unix.  A missing or undecryptable
//! key file at load time is [`VaultError::KeyUnavailable`] — fatal for the
//! whole vault, since no stored record can be opened without it.

use std::path::{Path, PathBuf};

use crate::crypto::{self, MasterKey};
use crate::error::{Result, VaultError};

/// Application salt mixed into the device-derived wrapping key.  Changing
/// this invalidates every key file written without a passphrase.  Must be
/// exactly [`crypto::SALT_LEN`] (32) bytes.
const APP_SALT: &[u8; crypto::SALT_LEN] = b"maestro-vault-master-key-v1\x00\x00\x00\x00\x00";

/// Minimum plausible key file size: salt + nonce + GCM tag.
const MIN_FILE_LEN: usize = crypto::SALT_LEN + crypto::NONCE_LEN_BYTES + 16;

/// Handle to the encrypted master key file.
pub struct MasterKeyFile {
    path: PathBuf,
}

impl MasterKeyFile {
    /// Create a handle for the key file at `path`.  The file itself is
    /// created on first [`load_or_init`](Self::load_or_init).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default key file location: `<data_dir>/master.key`.
    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join("master.key")
    }

    /// Whether a master key has been persisted yet.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the master key, generating and persisting a fresh one on first
    /// use.
    ///
    /// `passphrase` is the user secret protecting the key file.  When
    /// `None`, a device-derived secret (hostname + username) is used so the
    /// vault works unattended; a real passphrase is strictly stronger.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::KeyUnavailable`] if an existing file cannot be
    /// read or unlocked with the given passphrase.
    pub fn load_or_init(&self, passphrase: Option<&[u8]>) -> Result<MasterKey> {
        if self.exists() {
            return self.load(passphrase);
        }

        let master = MasterKey::generate()?;
        self.store(&master, passphrase)?;
        tracing::info!(path = %self.path.display(), "generated new master key");
        Ok(master)
    }

    /// Load an existing master key.
    pub fn load(&self, passphrase: Option<&[u8]>) -> Result<MasterKey> {
        let data = std::fs::read(&self.path).map_err(|e| VaultError::KeyUnavailable {
            reason: format!("cannot read key file {}: {e}", self.path.display()),
        })?;

        if data.len() < MIN_FILE_LEN {
            return Err(VaultError::KeyUnavailable {
                reason: "key file is truncated or corrupted".into(),
            });
        }

        let (salt, rest) = data.split_at(crypto::SALT_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(crypto::NONCE_LEN_BYTES);

        let mut nonce = [0u8; crypto::NONCE_LEN_BYTES];
        nonce.copy_from_slice(nonce_bytes);

        let wrapping = Self::wrapping_key(passphrase, salt);
        let blob = crypto::SealedBlob {
            nonce,
            ciphertext: ciphertext.to_vec(),
        };

        let key_bytes = crypto::open(&blob, &wrapping).map_err(|_| VaultError::KeyUnavailable {
            reason: "key file cannot be unlocked — wrong passphrase or corrupted file".into(),
        })?;

        if key_bytes.len() != crypto::KEY_LEN {
            return Err(VaultError::KeyUnavailable {
                reason: "key file holds a key of unexpected length".into(),
            });
        }

        let mut bytes = [0u8; crypto::KEY_LEN];
        bytes.copy_from_slice(&key_bytes);

        tracing::debug!(path = %self.path.display(), "loaded master key");
        Ok(MasterKey::from_bytes(bytes))
    }

    /// Persist (or overwrite) the master key.  Used at first init and after
    /// [`Vault::rotate_master_key`](crate::store::Vault::rotate_master_key).
    pub fn store(&self, master: &MasterKey, passphrase: Option<&[u8]>) -> Result<()> {
        let salt = crypto::generate_salt()?;
        let wrapping = Self::wrapping_key(passphrase, &salt);

        let blob = crypto::seal(master.as_bytes(), &wrapping)?;

        let mut data =
            Vec::with_capacity(crypto::SALT_LEN + crypto::NONCE_LEN_BYTES + blob.ciphertext.len());
        data.extend_from_slice(&salt);
        data.extend_from_slice(&blob.nonce);
        data.extend_from_slice(&blob.ciphertext);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, &data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.path, perms)?;
        }

        tracing::info!(path = %self.path.display(), "stored master key");
        Ok(())
    }

    /// Delete the stored key file (vault reset).  A no-op if absent.
    pub fn delete(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
            tracing::info!(path = %self.path.display(), "deleted master key file");
        }
        Ok(())
    }

    // -- Internal helpers ---------------------------------------------------

    /// Derive the wrapping key from the passphrase (or device material) and
    /// the per-file salt.
    fn wrapping_key(passphrase: Option<&[u8]>, salt: &[u8]) -> MasterKey {
        match passphrase {
            Some(secret) => crypto::derive_key(secret, salt),
            None => {
                let material = Self::device_material();
                crypto::derive_key(&material, salt)
            }
        }
    }

    /// Machine-specific key material: hostname + username + app salt.
    ///
    /// Reconstructible by anyone with access to the same machine account —
    /// a passphrase or OS keychain is stronger, but this keeps the key off
    /// disk in plaintext for unattended use.
    fn device_material() -> Vec<u8> {
        let hostname = std::fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .or_else(|_| std::env::var("HOSTNAME"))
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "unknown-host".into());
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown-user".into());

        let mut material = Vec::with_capacity(hostname.len() + username.len() + APP_SALT.len());
        material.extend_from_slice(hostname.as_bytes());
        material.extend_from_slice(username.as_bytes());
        material.extend_from_slice(APP_SALT);
        material
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
