//! Secret types for the platform stack.
//!
//! Encryption keys and signing material never appear in `Debug` output.

use std::fmt;
use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};

/// A validated encryption key: canonical lowercase hex encoding of 32 bytes.
///
/// The only constructors go through validation, so holding an
/// `EncryptionKey` means the value is well-formed.
pub struct EncryptionKey {
    value: SecretString,
}

impl EncryptionKey {
    pub(crate) fn from_validated(hex: String) -> Self {
        Self {
            value: SecretString::from(hex),
        }
    }

    /// Expose the hex encoded key.
    ///
    /// Use sparingly and ensure the exposed value isn't logged.
    pub fn expose_hex(&self) -> &str {
        self.value.expose_secret()
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

impl Clone for EncryptionKey {
    fn clone(&self) -> Self {
        Self {
            value: SecretString::from(self.value.expose_secret().to_string()),
        }
    }
}

/// The pair of access tokens derived from the signing secret.
#[derive(Clone, PartialEq, Eq)]
pub struct SignedTokens {
    /// Token asserting the `anon` role.
    pub public: String,
    /// Token asserting the `service_role` role.
    pub private: String,
}

impl fmt::Debug for SignedTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedTokens")
            .field("public", &self.public)
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// Errors that can occur while deriving or loading secrets.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SecretError {
    #[error("Invalid encryption key: {0}")]
    InvalidEncryptionKey(String),

    #[error("Key file {path} exists but is not a regular file")]
    NotARegularFile { path: PathBuf },

    #[error("Insecure permissions on {path}: got {mode:o}, want 0600")]
    InsecurePermissions { path: PathBuf, mode: u32 },

    #[error("Key file {path}: {reason}")]
    KeyFile { path: PathBuf, reason: String },

    #[error("Key provider failed: {0}")]
    Provider(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),
}

#[cfg(test)]
mod tests {
    use crate::secrets::types::{EncryptionKey, SignedTokens};

    #[test]
    fn test_encryption_key_redaction() {
        let key = EncryptionKey::from_validated("ab".repeat(32));
        let debug_str = format!("{:?}", key);
        assert!(!debug_str.contains("abab"));
        assert!(debug_str.contains("REDACTED"));
    }

    #[test]
    fn test_signed_tokens_hide_private() {
        let tokens = SignedTokens {
            public: "public-token".to_string(),
            private: "private-token".to_string(),
        };
        let debug_str = format!("{:?}", tokens);
        assert!(debug_str.contains("public-token"));
        assert!(!debug_str.contains("private-token"));
    }
}
