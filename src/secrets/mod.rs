//! Key and secret material consumed by the platform configuration.
//!
//! - Random alphanumeric secrets for passwords and shared keys
//! - A validated 32-byte encryption key from a static, functional or
//!   file-backed source
//! - Deterministic HS256 access tokens derived from the signing secret

pub mod crypto;
pub mod encryption_key;
pub mod tokens;
pub mod types;

pub use crypto::{DEFAULT_SECRET_LEN, random_secret, validate_encryption_key};
pub use encryption_key::{EncryptionKeySource, KeyProvider};
pub use tokens::derive_signed_tokens;
pub use types::{EncryptionKey, SecretError, SignedTokens};
