//! AES-256-GCM encryption for stored OAuth tokens.
//!
//! Each token is sealed with its own random nonce. The stored blob is the 12-byte
//! nonce followed by the ciphertext and GCM tag, so one column holds everything
//! needed to open it again. The master key is 32 bytes, base64 encoded, and comes
//! from the `FLOWLINK_TOKEN_ENCRYPTION_KEY` environment variable.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE as BASE64_URL},
    Engine,
};
use once_cell::sync::OnceCell;
use rand::RngCore;
use std::fmt;
use std::sync::Arc;

/// Environment variable holding the base64-encoded master key
pub const ENCRYPTION_KEY_ENV: &str = "FLOWLINK_TOKEN_ENCRYPTION_KEY";

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Token cipher errors.
///
/// `Decryption` means the stored credential can no longer be opened with the
/// current key. It is never transient: the user has to reconnect the service.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("token encryption key is not configured")]
    MissingKey,
    #[error("invalid token encryption key: {0}")]
    InvalidKey(String),
    #[error("token encryption failed")]
    Encryption,
    #[error("token decryption failed (wrong key or corrupted data)")]
    Decryption,
}

/// Decodes a base64 master key and checks it is exactly 32 bytes.
///
/// Both the standard and the URL-safe alphabets are accepted so keys generated
/// by other tooling keep working.
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>, CipherError> {
    let trimmed = key_base64.trim();
    let key_bytes = BASE64
        .decode(trimmed)
        .or_else(|_| BASE64_URL.decode(trimmed))
        .map_err(|e| CipherError::InvalidKey(format!("not valid base64: {}", e)))?;

    if key_bytes.len() != KEY_SIZE {
        return Err(CipherError::InvalidKey(format!(
            "key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        )));
    }

    Ok(key_bytes)
}

/// Generates a fresh random master key, base64 encoded.
pub fn generate_key() -> String {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    BASE64.encode(key)
}

/// Authenticated symmetric cipher for token strings.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    /// Builds a cipher from a base64-encoded 32-byte key.
    pub fn new(key_base64: &str) -> Result<Self, CipherError> {
        let key_bytes = validate_key(key_base64)?;
        Self::from_key_bytes(&key_bytes)
    }

    /// Builds a cipher from raw key bytes.
    pub fn from_key_bytes(key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != KEY_SIZE {
            return Err(CipherError::InvalidKey(format!(
                "key must be {} bytes",
                KEY_SIZE
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;

        Ok(Self { cipher })
    }

    /// Builds a cipher from `FLOWLINK_TOKEN_ENCRYPTION_KEY`.
    pub fn from_env() -> Result<Self, CipherError> {
        let key = std::env::var(ENCRYPTION_KEY_ENV).map_err(|_| CipherError::MissingKey)?;
        if key.trim().is_empty() {
            return Err(CipherError::MissingKey);
        }
        Self::new(&key)
    }

    /// Process-wide cipher, built from the environment on first use.
    ///
    /// A failed initialization is not cached, so setting the variable and calling
    /// again succeeds.
    pub fn shared() -> Result<Arc<TokenCipher>, CipherError> {
        static SHARED: OnceCell<Arc<TokenCipher>> = OnceCell::new();
        SHARED
            .get_or_try_init(|| Self::from_env().map(Arc::new))
            .cloned()
    }

    /// Encrypts a token. Output is `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, CipherError> {
        // Never reuse a nonce under the same key
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encryption)?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypts a blob produced by [`TokenCipher::encrypt`].
    pub fn decrypt(&self, blob: &[u8]) -> Result<String, CipherError> {
        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CipherError::Decryption);
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CipherError::Decryption)?;

        String::from_utf8(plaintext).map_err(|_| CipherError::Decryption)
    }
}
