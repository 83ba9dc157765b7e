//! Machine-bound encryption for secret settings.
//!
//! Provider credentials are stored in the settings table as opaque base64
//! blobs. The key never touches disk: it is derived per-ciphertext from a
//! machine identity string (hostname + OS + architecture) and a random salt
//! using Argon2id, then used for AES-256-GCM. Moving the database to another
//! machine makes every blob undecryptable, which is the intended property.
//!
//! Blob layout, base64-encoded as one string:
//!
//! ```text
//! [version: 1 byte][salt: 16 bytes][nonce: 12 bytes][ciphertext + tag]
//! ```
//!
//! The leading version byte is mandatory so a future algorithm change can
//! coexist with stored blobs; readers reject unknown versions instead of
//! returning raw bytes.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use thiserror::Error;

const VERSION_V1: u8 = 0x01;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_BLOB_LEN: usize = 1 + SALT_LEN + NONCE_LEN + TAG_LEN;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("ciphertext is not valid base64")]
    NotBase64,
    #[error("ciphertext is truncated")]
    Truncated,
    #[error("unknown ciphertext version: {0:#04x}")]
    UnknownVersion(u8),
    #[error("authentication failed (tampered data or wrong machine)")]
    AuthFailed,
    #[error("key derivation failed")]
    Key,
}

/// Symmetric vault bound to this machine's identity.
#[derive(Clone)]
pub struct Vault {
    secret: String,
}

impl Vault {
    /// Vault keyed by the local machine identity.
    pub fn new() -> Self {
        Self {
            secret: machine_identity(),
        }
    }

    /// Vault keyed by an explicit secret. Used by tests to simulate the
    /// "database moved to another machine" case.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Encrypts `plaintext` into a self-describing base64 blob.
    ///
    /// Salt and nonce are freshly random per call, so encrypting the same
    /// plaintext twice yields different blobs.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce);

        let key = self.derive_key(&salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| VaultError::Key)?;

        let mut blob = Vec::with_capacity(MIN_BLOB_LEN + ciphertext.len());
        blob.push(VERSION_V1);
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(blob))
    }

    /// Decrypts a blob produced by [`Vault::encrypt`].
    pub fn decrypt(&self, encoded: &str) -> Result<String, VaultError> {
        let blob = BASE64
            .decode(encoded.trim())
            .map_err(|_| VaultError::NotBase64)?;

        if blob.is_empty() {
            return Err(VaultError::Truncated);
        }
        if blob[0] != VERSION_V1 {
            return Err(VaultError::UnknownVersion(blob[0]));
        }
        if blob.len() < MIN_BLOB_LEN {
            return Err(VaultError::Truncated);
        }

        let salt = &blob[1..1 + SALT_LEN];
        let nonce = &blob[1 + SALT_LEN..1 + SALT_LEN + NONCE_LEN];
        let ciphertext = &blob[1 + SALT_LEN + NONCE_LEN..];

        let key = self.derive_key(salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| VaultError::AuthFailed)?;

        String::from_utf8(plaintext).map_err(|_| VaultError::AuthFailed)
    }

    /// Whether `s` looks like a blob this vault produced.
    ///
    /// True only when the string decodes as base64, is long enough to hold
    /// the header plus an authentication tag, and starts with a recognised
    /// version byte. Arbitrary user text never qualifies.
    pub fn is_encrypted(s: &str) -> bool {
        match BASE64.decode(s.trim()) {
            Ok(blob) => blob.len() >= MIN_BLOB_LEN && blob[0] == VERSION_V1,
            Err(_) => false,
        }
    }

    fn derive_key(&self, salt: &[u8]) -> Result<[u8; 32], VaultError> {
        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(self.secret.as_bytes(), salt, &mut key)
            .map_err(|_| VaultError::Key)?;
        Ok(key)
    }
}

impl Default for Vault {
    fn default() -> Self {
        Self::new()
    }
}

/// Machine identity string the key is derived from.
///
/// Hostname resolution is best-effort (env var, then /etc/hostname); the OS
/// and architecture components come from compile-time constants.
fn machine_identity() -> String {
    let hostname = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_owned())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_owned());

    format!(
        "{}|{}|{}",
        hostname,
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
