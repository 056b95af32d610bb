//! AES-256-GCM sealing and key derivation using the `ring` crate.
//!
//! Everything the vault persists goes through [`seal`] on the way to disk
//! and [`open`] on the way back.  Keys are represented by [`MasterKey`],
//! which zeroes its memory on drop.
//!
//! - **Sealing**: AES-256-GCM authenticated encryption with a randomly
//!   generated 96-bit nonce per call; the 128-bit tag is appended to the
//!   ciphertext.
//! - **Key derivation**: PBKDF2-HMAC-SHA256 (600,000 iterations, OWASP
//!   2023) derives a 256-bit key from a passphrase and salt.
//!
//! Random nonces are safe here: with 96 bits of nonce the collision
//! probability stays negligible for up to ~2^32 seals under one key, far
//! beyond the write volume of a credential store.

use ring::aead::{self, Aad, BoundKey, NONCE_LEN, Nonce, NonceSequence, SealingKey, UnboundKey};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, VaultError};

/// Length of the AES-256-GCM key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the AES-256-GCM nonce in bytes (96 bits).
pub const NONCE_LEN_BYTES: usize = NONCE_LEN;

/// Length of the PBKDF2 salt in bytes.
pub const SALT_LEN: usize = 32;

/// PBKDF2 iteration count for HMAC-SHA256.
const PBKDF2_ITERATIONS: u32 = 600_000;

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;
static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

// ---------------------------------------------------------------------------
// Master key
// ---------------------------------------------------------------------------

/// A 256-bit symmetric key.  Zeroed on drop.
///
/// The process-wide master key encrypting every credential record is a
/// `MasterKey`; so is the device-derived wrapping key protecting the key
/// file on disk.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random key from the system CSPRNG.
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; KEY_LEN];
        rng.fill(&mut bytes)
            .map_err(|_| VaultError::Internal("failed to generate random key".into()))?;
        Ok(Self(bytes))
    }

    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// A single-use nonce sequence that yields exactly one nonce and then errors.
///
/// `ring` requires a [`NonceSequence`] for sealing operations.  Since a
/// fresh random nonce is generated per call, this wrapper ensures each
/// sealing key is used exactly once.
struct SingleNonce(Option<[u8; NONCE_LEN_BYTES]>);

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Sealing
// ---------------------------------------------------------------------------

/// A sealed (encrypted + authenticated) blob together with its nonce.
pub struct SealedBlob {
    /// The 96-bit nonce used for this seal.
    pub nonce: [u8; NONCE_LEN_BYTES],
    /// Ciphertext with the 128-bit GCM tag appended.
    pub ciphertext: Vec<u8>,
}

/// Seal `plaintext` under `key` with AES-256-GCM.
///
/// # Errors
///
/// Returns [`VaultError::EncryptionFailed`] if `ring` reports a failure or
/// nonce generation fails.
pub fn seal(plaintext: &[u8], key: &MasterKey) -> Result<SealedBlob> {
    let rng = SystemRandom::new();

    let mut nonce = [0u8; NONCE_LEN_BYTES];
    rng.fill(&mut nonce)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "failed to generate random nonce".into(),
        })?;

    let unbound =
        UnboundKey::new(AEAD_ALG, key.as_bytes()).map_err(|_| VaultError::EncryptionFailed {
            reason: "failed to create AES-256-GCM key".into(),
        })?;
    let mut sealing_key = SealingKey::new(unbound, SingleNonce(Some(nonce)));

    // `ring` encrypts in-place and appends the authentication tag.
    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::empty(), &mut in_out)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "seal_in_place failed".into(),
        })?;

    tracing::trace!(
        plaintext_len = plaintext.len(),
        ciphertext_len = in_out.len(),
        "sealed blob"
    );

    Ok(SealedBlob {
        nonce,
        ciphertext: in_out,
    })
}

/// Open a sealed blob, returning the plaintext.
///
/// # Errors
///
/// Returns [`VaultError::DecryptionFailed`] if the key is wrong, the
/// ciphertext was tampered with, or the nonce does not match.  Callers that
/// read stored records translate this into
/// [`VaultError::CorruptRecord`](crate::VaultError::CorruptRecord).
pub fn open(blob: &SealedBlob, key: &MasterKey) -> Result<Vec<u8>> {
    let unbound =
        UnboundKey::new(AEAD_ALG, key.as_bytes()).map_err(|_| VaultError::DecryptionFailed {
            reason: "failed to create AES-256-GCM key".into(),
        })?;
    let mut opening_key = aead::OpeningKey::new(unbound, SingleNonce(Some(blob.nonce)));

    let mut in_out = blob.ciphertext.clone();
    let plaintext = opening_key
        .open_in_place(Aad::empty(), &mut in_out)
        .map_err(|_| VaultError::DecryptionFailed {
            reason: "authentication failed — wrong key or tampered data".into(),
        })?;

    Ok(plaintext.to_vec())
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Generate a random PBKDF2 salt.
pub fn generate_salt() -> Result<[u8; SALT_LEN]> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt)
        .map_err(|_| VaultError::KeyDerivationFailed {
            reason: "failed to generate random salt".into(),
        })?;
    Ok(salt)
}

/// Derive a 256-bit key from `passphrase` and a known `salt` via
/// PBKDF2-HMAC-SHA256.  Deterministic: the same inputs always produce the
/// same key.
pub fn derive_key(passphrase: &[u8], salt: &[u8]) -> MasterKey {
    let iterations =
        std::num::NonZeroU32::new(PBKDF2_ITERATIONS).expect("PBKDF2_ITERATIONS is non-zero");
    let mut out = [0u8; KEY_LEN];
    pbkdf2::derive(PBKDF2_ALG, iterations, salt, passphrase, &mut out);
    MasterKey::from_bytes(out)
}

/// Generate `len` cryptographically secure random bytes.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf)
        .map_err(|_| VaultError::Internal("failed to generate random bytes".into()))?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = MasterKey::generate().unwrap();
        let plaintext = b"hello, maestro vault!";

        let blob = seal(plaintext, &key).unwrap();
        let opened = open(&blob, &key).unwrap();

        assert_eq!(opened, plaintext);
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let key1 = MasterKey::generate().unwrap();
        let key2 = MasterKey::generate().unwrap();

        let blob = seal(b"secret data", &key1).unwrap();
        assert!(open(&blob, &key2).is_err());
    }

    #[test]
    fn open_tampered_ciphertext_fails() {
        let key = MasterKey::generate().unwrap();
        let mut blob = seal(b"secret data", &key).unwrap();

        if let Some(byte) = blob.ciphertext.first_mut() {
            *byte ^= 0x01;
        }

        assert!(open(&blob, &key).is_err());
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = MasterKey::generate().unwrap();
        let blob = seal(b"", &key).unwrap();
        let opened = open(&blob, &key).unwrap();
        assert_eq!(opened, b"");
    }

    #[test]
    fn derive_key_is_deterministic() {
        let salt = generate_salt().unwrap();
        let k1 = derive_key(b"correct horse battery staple", &salt);
        let k2 = derive_key(b"correct horse battery staple", &salt);
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn derive_key_differs_per_salt() {
        let s1 = generate_salt().unwrap();
        let s2 = generate_salt().unwrap();
        let k1 = derive_key(b"passphrase", &s1);
        let k2 = derive_key(b"passphrase", &s2);
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn master_key_debug_is_redacted() {
        let key = MasterKey::generate().unwrap();
        assert_eq!(format!("{key:?}"), "MasterKey([REDACTED])");
    }

    #[test]
    fn distinct_nonces_per_seal() {
        let key = MasterKey::generate().unwrap();
        let b1 = seal(b"x", &key).unwrap();
        let b2 = seal(b"x", &key).unwrap();
        assert_ne!(b1.nonce, b2.nonce);
    }
}
