//! Versioned encryption envelope: the unit of ciphertext at rest and in
//! transit.
//!
//! Current primitive is XSalsa20-Poly1305 (24-byte nonce, 16-byte tag).
//! Envelopes written by older releases under AES-256-GCM are accepted for
//! decryption only. Associated data is bound by prepending a SHA-256 digest
//! of the AAD to the plaintext before sealing, since the primitive has no
//! native associated-data slot; the digest is also recorded on the envelope
//! so readers know binding is present.

use crate::crypto::keys::{KeyTier, SymmetricKey};
use crate::crypto::{CryptoError, Result};
use crypto_secretbox::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    XSalsa20Poly1305,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current envelope format revision.
pub const ENVELOPE_VERSION: u8 = 2;

/// Algorithm identifier for the current primitive.
pub const ALG_XSALSA20_POLY1305: &str = "xsalsa20poly1305";

/// Legacy algorithm identifier, accepted read-only. Predates AAD binding.
pub const ALG_AES_256_GCM: &str = "aes-256-gcm";

const AAD_DIGEST_LEN: usize = 32;
const XSALSA_NONCE_LEN: usize = 24;
const AES_GCM_NONCE_LEN: usize = 12;

/// Self-describing encrypted container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Format revision.
    pub version: u8,
    /// Authenticated-encryption primitive identifier.
    pub algorithm: String,
    /// Random nonce, unique per encryption.
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    /// Authenticated ciphertext (integrity tag included).
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// Sharing scope of the key that sealed this envelope.
    pub key_tier: String,
    /// Opaque version label of the concrete key used (enables rotation).
    pub key_id: String,
    /// SHA-256 digest of the associated data, present only when AAD was
    /// bound at encryption time.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes_opt")]
    pub aad_digest: Option<Vec<u8>>,
}

impl Envelope {
    /// Whether this envelope was sealed under the given key tier. Readers
    /// check this before resolving a key, instead of inferring the tier
    /// from payload content.
    pub fn sealed_under(&self, tier: &KeyTier) -> bool {
        self.key_tier == tier.as_str()
    }
}

/// Three-way classification of raw stored bytes, performed once at read
/// time instead of falling back on parse exceptions.
#[derive(Debug)]
pub enum EnvelopeKind {
    /// A well-formed envelope under a recognized algorithm.
    Envelope(Envelope),
    /// Pre-encryption legacy data stored as plain UTF-8.
    LegacyPlaintext(String),
    /// Neither an envelope nor readable plaintext.
    Corrupted,
}

/// Encrypt a payload into a fresh envelope.
///
/// A new random nonce is generated per call. If `aad` is given, its SHA-256
/// digest is prepended to the plaintext before sealing, binding the
/// ciphertext to that context: decryption under any other AAD fails even
/// with the correct key.
pub fn encrypt(
    plaintext: &[u8],
    key: &SymmetricKey,
    tier: &KeyTier,
    key_id: &str,
    aad: Option<&[u8]>,
) -> Result<Envelope> {
    if plaintext.is_empty() {
        return Err(CryptoError::EncryptionFailed(
            "Cannot encrypt empty payload".to_string(),
        ));
    }

    let cipher = XSalsa20Poly1305::new(key.as_bytes().into());
    let nonce = XSalsa20Poly1305::generate_nonce(&mut OsRng);

    let aad_digest = aad.map(|a| Sha256::digest(a).to_vec());

    let ciphertext = match &aad_digest {
        Some(digest) => {
            let mut bound = Vec::with_capacity(AAD_DIGEST_LEN + plaintext.len());
            bound.extend_from_slice(digest);
            bound.extend_from_slice(plaintext);
            cipher.encrypt(&nonce, bound.as_slice())
        }
        None => cipher.encrypt(&nonce, plaintext),
    }
    .map_err(|e| CryptoError::EncryptionFailed(format!("Envelope seal failed: {}", e)))?;

    Ok(Envelope {
        version: ENVELOPE_VERSION,
        algorithm: ALG_XSALSA20_POLY1305.to_string(),
        nonce: nonce.to_vec(),
        ciphertext,
        key_tier: tier.as_str().to_string(),
        key_id: key_id.to_string(),
        aad_digest,
    })
}

/// Decrypt an envelope.
///
/// Fails with [`CryptoError::AuthenticationFailed`] if the tag does not
/// verify (wrong key or tampered data). If the envelope carries an AAD
/// digest, the caller-supplied `aad` must hash to the bound digest or the
/// call fails with [`CryptoError::AadMismatch`] even though decryption
/// itself succeeded. Legacy AES-256-GCM envelopes never bind AAD.
pub fn decrypt(envelope: &Envelope, key: &SymmetricKey, aad: Option<&[u8]>) -> Result<Vec<u8>> {
    match envelope.algorithm.as_str() {
        ALG_XSALSA20_POLY1305 => decrypt_current(envelope, key, aad),
        ALG_AES_256_GCM => decrypt_legacy_aes_gcm(envelope, key),
        other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
    }
}

fn decrypt_current(envelope: &Envelope, key: &SymmetricKey, aad: Option<&[u8]>) -> Result<Vec<u8>> {
    if envelope.nonce.len() != XSALSA_NONCE_LEN {
        return Err(CryptoError::DecryptionFailed(format!(
            "Invalid nonce length: {}",
            envelope.nonce.len()
        )));
    }

    let cipher = XSalsa20Poly1305::new(key.as_bytes().into());
    let nonce = crypto_secretbox::Nonce::from_slice(&envelope.nonce);

    let opened = cipher
        .decrypt(nonce, envelope.ciphertext.as_slice())
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    match &envelope.aad_digest {
        None => Ok(opened),
        Some(bound_digest) => {
            if opened.len() < AAD_DIGEST_LEN {
                return Err(CryptoError::DecryptionFailed(
                    "Bound payload shorter than AAD digest".to_string(),
                ));
            }
            let supplied = match aad {
                Some(a) => Sha256::digest(a),
                None => return Err(CryptoError::AadMismatch),
            };
            let embedded = &opened[..AAD_DIGEST_LEN];
            if embedded != supplied.as_slice() || embedded != bound_digest.as_slice() {
                return Err(CryptoError::AadMismatch);
            }
            Ok(opened[AAD_DIGEST_LEN..].to_vec())
        }
    }
}

/// Read-only compatibility path for envelopes sealed before the primitive
/// migration.
fn decrypt_legacy_aes_gcm(envelope: &Envelope, key: &SymmetricKey) -> Result<Vec<u8>> {
    use aes_gcm::{
        aead::{Aead as _, KeyInit as _},
        Aes256Gcm, Nonce,
    };

    if envelope.nonce.len() != AES_GCM_NONCE_LEN {
        return Err(CryptoError::DecryptionFailed(format!(
            "Invalid legacy nonce length: {}",
            envelope.nonce.len()
        )));
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());

    cipher
        .decrypt(
            Nonce::from_slice(&envelope.nonce),
            envelope.ciphertext.as_slice(),
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Classify raw stored bytes once at read time.
pub fn classify(raw: &[u8]) -> EnvelopeKind {
    if let Ok(envelope) = serde_json::from_slice::<Envelope>(raw) {
        match envelope.algorithm.as_str() {
            ALG_XSALSA20_POLY1305 | ALG_AES_256_GCM => return EnvelopeKind::Envelope(envelope),
            _ => return EnvelopeKind::Corrupted,
        }
    }
    match std::str::from_utf8(raw) {
        Ok(text) if !text.trim().is_empty() => EnvelopeKind::LegacyPlaintext(text.to_string()),
        _ => EnvelopeKind::Corrupted,
    }
}

/// Custom base64 serialization for `Vec<u8>`.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Custom base64 serialization for `Option<Vec<u8>>`.
mod base64_bytes_opt {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s = Option::<String>::deserialize(d)?;
        s.map(|s| STANDARD.decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
