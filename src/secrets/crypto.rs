//! Random material and key validation.
//!
//! ```text
//! OS CSPRNG ─┬─► alphanumeric sampler ─► passwords, dashboard creds, log keys
//!            │
//!            └─► 32 raw bytes ─► lowercase hex ─► encryption key
//! ```

use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::secrets::types::{EncryptionKey, SecretError};

/// Size of the encryption key in bytes.
pub const KEY_SIZE: usize = 32;

/// Length of the hex encoded encryption key.
pub const KEY_HEX_LEN: usize = KEY_SIZE * 2;

/// Length used for generated passwords and shared secrets.
pub const DEFAULT_SECRET_LEN: usize = 32;

/// Generate a random alphanumeric string of `len` characters.
///
/// Backed by the thread-local CSPRNG; suitable for passwords and shared
/// secrets, not for key material that needs full byte entropy.
pub fn random_secret(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate a fresh hex encoded 32-byte key.
pub fn generate_key_hex() -> String {
    let mut bytes = [0u8; KEY_SIZE];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    hex::encode(bytes)
}

/// Validate a candidate key.
///
/// Accepts exactly 64 hex characters that survive a decode/encode round
/// trip unchanged, which rules out uppercase digits.
pub fn validate_encryption_key(candidate: &str) -> Result<EncryptionKey, SecretError> {
    if candidate.len() != KEY_HEX_LEN {
        return Err(SecretError::InvalidEncryptionKey(format!(
            "got {} chars, want {} hex chars",
            candidate.len(),
            KEY_HEX_LEN
        )));
    }

    let raw = hex::decode(candidate)
        .map_err(|e| SecretError::InvalidEncryptionKey(format!("invalid hex: {}", e)))?;

    let canonical = hex::encode(raw);
    if canonical != candidate {
        return Err(SecretError::InvalidEncryptionKey(
            "key is not in canonical lowercase form".to_string(),
        ));
    }

    Ok(EncryptionKey::from_validated(canonical))
}
