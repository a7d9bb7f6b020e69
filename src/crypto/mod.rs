//! Cryptographic core: envelope encryption, key tiers, and key exchange.
//!
//! This module provides:
//! - XSalsa20-Poly1305 envelope encryption with AAD binding
//! - Device and couple key tiers with strict no-fallback resolution
//! - X25519 + HKDF-SHA256 couple key derivation
//! - Secure credential store abstraction

pub mod envelope;
pub mod exchange;
pub mod keys;
pub mod secrets;

pub use envelope::{decrypt, encrypt, Envelope, EnvelopeKind};
pub use exchange::CoupleKeyExchange;
pub use keys::{KeyTier, Keystore, ResolvedKey, SymmetricKey};
pub use secrets::{CredentialStore, KeyringStore, MemoryStore};

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Authentication failed - data may have been tampered with")]
    AuthenticationFailed,

    /// Decryption succeeded but the bound context does not match the
    /// caller-supplied associated data. Signals possible ciphertext
    /// relocation between records.
    #[error("Associated data mismatch - ciphertext bound to a different context")]
    AadMismatch,

    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Unsupported envelope algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Credential store error: {0}")]
    CredentialStore(String),
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
