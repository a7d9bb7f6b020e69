//! Couple key exchange: X25519 agreement + HKDF-SHA256 derivation.
//!
//! Each device holds a local X25519 keypair in the credential store. Once
//! the partner's public key is available, a Diffie-Hellman exchange yields
//! a shared secret which is never used directly: it is passed through
//! HKDF-SHA256 (extract-then-expand, RFC 5869) with a fixed
//! domain-separation info string. Derived keys are versioned per pairing id
//! so rotation leaves older envelopes readable.

use crate::crypto::keys::SymmetricKey;
use crate::crypto::secrets::CredentialStore;
use crate::crypto::{CryptoError, Result as CryptoResult};
use crate::{BetweenUsError, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use hkdf::Hkdf;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use x25519_dalek::{PublicKey, StaticSecret};

/// Domain-separation info string for couple key derivation.
pub const COUPLE_KEY_INFO: &[u8] = b"betweenus-couple-key-v2";

/// Required length of a derived symmetric key.
pub const SYMMETRIC_KEY_LEN: usize = 32;

const LOCAL_SECRET_NAME: &str = "exchange_secret.v1";

fn couple_key_name(pairing_id: &str, version: u32) -> String {
    format!("couple_key.{}.v{}", pairing_id, version)
}

fn version_name(pairing_id: &str) -> String {
    format!("couple_key.{}.version", pairing_id)
}

/// Derive a key of `len` bytes from a raw shared secret via HKDF-SHA256.
///
/// Deterministic: identical (secret, salt, info, len) inputs always yield
/// identical output; changing any one of them changes the output.
pub fn derive_couple_key(
    shared_secret: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    len: usize,
) -> CryptoResult<Vec<u8>> {
    let hkdf = Hkdf::<Sha256>::new(salt, shared_secret);
    let mut okm = vec![0u8; len];
    hkdf.expand(info, &mut okm)
        .map_err(|e| CryptoError::KdfFailed(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

/// Derives, versions, and persists couple keys per pairing id.
pub struct CoupleKeyExchange {
    store: Arc<dyn CredentialStore>,
    cache: Mutex<HashMap<String, (SymmetricKey, u32)>>,
}

impl CoupleKeyExchange {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Load the local X25519 keypair, generating and persisting one on
    /// first use. Returns the public key bytes for publication.
    pub fn ensure_local_keypair(&self) -> Result<[u8; 32]> {
        let secret = self.local_secret()?;
        Ok(*PublicKey::from(&secret).as_bytes())
    }

    /// Perform the X25519 exchange with the partner's public key, then
    /// derive and persist the couple key. Returns the new key id.
    pub fn exchange_and_store(&self, pairing_id: &str, partner_public: &[u8; 32]) -> Result<String> {
        let secret = self.local_secret()?;
        let shared = secret.diffie_hellman(&PublicKey::from(*partner_public));
        self.derive_and_store(pairing_id, shared.as_bytes())
    }

    /// Derive a couple key from a raw shared secret and persist it under
    /// the pairing id. Re-deriving for an existing pairing bumps the key
    /// version (rotation); earlier versions stay readable.
    pub fn derive_and_store(&self, pairing_id: &str, shared_secret: &[u8]) -> Result<String> {
        if pairing_id.is_empty() {
            return Err(BetweenUsError::Configuration(
                "couple key derivation requires a pairing id".to_string(),
            ));
        }

        let key_bytes =
            derive_couple_key(shared_secret, None, COUPLE_KEY_INFO, SYMMETRIC_KEY_LEN)?;
        if key_bytes.len() != SYMMETRIC_KEY_LEN {
            return Err(BetweenUsError::Configuration(format!(
                "derived key has invalid length {} (expected {})",
                key_bytes.len(),
                SYMMETRIC_KEY_LEN
            )));
        }

        let version = self.stored_version(pairing_id)?.unwrap_or(0) + 1;

        self.store
            .set(&couple_key_name(pairing_id, version), &STANDARD.encode(&key_bytes))?;
        self.store
            .set(&version_name(pairing_id), &version.to_string())?;

        let key_array: [u8; 32] =
            key_bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: SYMMETRIC_KEY_LEN,
                    got: key_bytes.len(),
                })?;
        let key = SymmetricKey::from_bytes(key_array);

        let mut cache = self.lock_cache()?;
        cache.insert(pairing_id.to_string(), (key, version));

        Ok(format!("couple:v{}", version))
    }

    /// Whether a derived couple key exists for this pairing.
    pub fn has_couple_key(&self, pairing_id: &str) -> bool {
        matches!(self.couple_key(pairing_id), Ok(Some(_)))
    }

    /// Current key version label for this pairing, e.g. `"v2"`.
    pub fn key_version(&self, pairing_id: &str) -> Result<String> {
        match self.stored_version(pairing_id)? {
            Some(version) => Ok(format!("v{}", version)),
            None => Err(BetweenUsError::Configuration(format!(
                "no couple key derived for pairing '{}'",
                pairing_id
            ))),
        }
    }

    /// Fetch the current couple key and version, consulting the in-memory
    /// cache before the credential store.
    pub fn couple_key(&self, pairing_id: &str) -> Result<Option<(SymmetricKey, u32)>> {
        {
            let cache = self.lock_cache()?;
            if let Some((key, version)) = cache.get(pairing_id) {
                return Ok(Some((key.clone(), *version)));
            }
        }

        let version = match self.stored_version(pairing_id)? {
            Some(v) => v,
            None => return Ok(None),
        };
        let encoded = match self.store.get(&couple_key_name(pairing_id, version))? {
            Some(e) => e,
            None => return Ok(None),
        };

        let key_bytes = STANDARD
            .decode(&encoded)
            .map_err(|e| CryptoError::KdfFailed(format!("Stored couple key invalid: {}", e)))?;
        let key_array: [u8; 32] =
            key_bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: SYMMETRIC_KEY_LEN,
                    got: key_bytes.len(),
                })?;
        let key = SymmetricKey::from_bytes(key_array);

        let mut cache = self.lock_cache()?;
        cache.insert(pairing_id.to_string(), (key.clone(), version));
        Ok(Some((key, version)))
    }

    /// Fetch a historical key version, for envelopes sealed before a
    /// rotation.
    pub fn couple_key_at(&self, pairing_id: &str, version: u32) -> Result<Option<SymmetricKey>> {
        let encoded = match self.store.get(&couple_key_name(pairing_id, version))? {
            Some(e) => e,
            None => return Ok(None),
        };
        let key_bytes = STANDARD
            .decode(&encoded)
            .map_err(|e| CryptoError::KdfFailed(format!("Stored couple key invalid: {}", e)))?;
        let key_array: [u8; 32] =
            key_bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: SYMMETRIC_KEY_LEN,
                    got: key_bytes.len(),
                })?;
        Ok(Some(SymmetricKey::from_bytes(key_array)))
    }

    /// Drop all in-memory key material. Invoked on sign-out; persisted
    /// keys remain in the credential store.
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    fn local_secret(&self) -> Result<StaticSecret> {
        if let Some(encoded) = self.store.get(LOCAL_SECRET_NAME)? {
            let bytes = STANDARD.decode(&encoded).map_err(|e| {
                CryptoError::KdfFailed(format!("Stored exchange secret invalid: {}", e))
            })?;
            let array: [u8; 32] =
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CryptoError::InvalidKeyLength {
                        expected: 32,
                        got: bytes.len(),
                    })?;
            return Ok(StaticSecret::from(array));
        }

        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        self.store
            .set(LOCAL_SECRET_NAME, &STANDARD.encode(secret.as_bytes()))?;
        Ok(secret)
    }

    fn stored_version(&self, pairing_id: &str) -> Result<Option<u32>> {
        match self.store.get(&version_name(pairing_id))? {
            Some(raw) => raw
                .parse::<u32>()
                .map(Some)
                .map_err(|e| BetweenUsError::InvalidInput(format!("Invalid key version: {}", e))),
            None => Ok(None),
        }
    }

    fn lock_cache(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (SymmetricKey, u32)>>> {
        self.cache
            .lock()
            .map_err(|_| CryptoError::CredentialStore("Key cache lock poisoned".to_string()).into())
    }
}
