//! Key tiers and the session-scoped key resolver.
//!
//! Two tiers exist: a per-device random key and a per-couple derived key.
//! Resolution is strict: couple-tier data is never silently downgraded to
//! the device key, because the other partner could not read it.

use crate::crypto::exchange::CoupleKeyExchange;
use crate::crypto::secrets::CredentialStore;
use crate::crypto::CryptoError;
use crate::{BetweenUsError, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::sync::{Arc, Mutex};
use zeroize::Zeroize;

const DEVICE_KEY_NAME: &str = "device_key.v1";
const DEVICE_KEY_ID: &str = "device:v1";

/// Sharing scope of a symmetric key.
///
/// Explicit tagged union: couple scope carries its pairing id, so a tier
/// can never be inferred ad hoc from untrusted payload content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyTier {
    /// One random key per device, never leaves it.
    Device,
    /// One derived key per pair, shared by both members.
    Couple { pairing_id: String },
}

impl KeyTier {
    /// Build a couple tier from an optional pairing id, failing fast when
    /// none is configured.
    pub fn couple(pairing_id: Option<&str>) -> Result<Self> {
        match pairing_id {
            Some(id) if !id.is_empty() => Ok(Self::Couple {
                pairing_id: id.to_string(),
            }),
            _ => Err(BetweenUsError::Configuration(
                "couple tier requested without a pairing id".to_string(),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Couple { .. } => "couple",
        }
    }
}

/// A 256-bit symmetric key, zeroized on drop.
#[derive(Clone)]
pub struct SymmetricKey {
    key: [u8; 32],
}

impl SymmetricKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        Self { key: rand::random() }
    }

    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Concrete key material plus the version label that identifies it.
pub struct ResolvedKey {
    pub key: SymmetricKey,
    pub key_id: String,
}

/// Session-scoped keystore: resolves key tiers to concrete keys.
///
/// Constructed once per authenticated session; all in-memory key material
/// is dropped by [`Keystore::clear_cache`] on sign-out. Resolution never
/// performs network I/O.
pub struct Keystore {
    store: Arc<dyn CredentialStore>,
    exchange: CoupleKeyExchange,
    device_key: Mutex<Option<SymmetricKey>>,
}

impl Keystore {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            exchange: CoupleKeyExchange::new(store.clone()),
            store,
            device_key: Mutex::new(None),
        }
    }

    /// The key exchange handle sharing this keystore's credential store.
    pub fn exchange(&self) -> &CoupleKeyExchange {
        &self.exchange
    }

    /// Explicitly initialize the device key: generated on first call,
    /// persisted in the credential store, memoized for the session.
    pub fn ensure_device_key(&self) -> Result<SymmetricKey> {
        let mut cached = self
            .device_key
            .lock()
            .map_err(|_| CryptoError::CredentialStore("Device key lock poisoned".to_string()))?;
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }

        let key = match self.store.get(DEVICE_KEY_NAME)? {
            Some(encoded) => {
                let bytes = STANDARD.decode(&encoded).map_err(|e| {
                    CryptoError::CredentialStore(format!("Stored device key invalid: {}", e))
                })?;
                let array: [u8; 32] =
                    bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| CryptoError::InvalidKeyLength {
                            expected: 32,
                            got: bytes.len(),
                        })?;
                SymmetricKey::from_bytes(array)
            }
            None => {
                let key = SymmetricKey::generate();
                self.store
                    .set(DEVICE_KEY_NAME, &STANDARD.encode(key.as_bytes()))?;
                key
            }
        };

        *cached = Some(key.clone());
        Ok(key)
    }

    /// Resolve a tier to concrete key material and its version label.
    ///
    /// Couple tier with no derived key fails with a configuration error
    /// rather than falling back to the device key: a device-encrypted
    /// payload would be unreadable by the other partner.
    pub fn resolve(&self, tier: &KeyTier) -> Result<ResolvedKey> {
        match tier {
            KeyTier::Device => Ok(ResolvedKey {
                key: self.ensure_device_key()?,
                key_id: DEVICE_KEY_ID.to_string(),
            }),
            KeyTier::Couple { pairing_id } => {
                if pairing_id.is_empty() {
                    return Err(BetweenUsError::Configuration(
                        "couple tier requested without a pairing id".to_string(),
                    ));
                }
                match self.exchange.couple_key(pairing_id)? {
                    Some((key, version)) => Ok(ResolvedKey {
                        key,
                        key_id: format!("couple:v{}", version),
                    }),
                    None => Err(BetweenUsError::Configuration(format!(
                        "no couple key derived for pairing '{}' - refusing device-key fallback",
                        pairing_id
                    ))),
                }
            }
        }
    }

    /// Resolve for an interactive write path: an absent couple key is
    /// surfaced as [`BetweenUsError::ReconnectRequired`] so the caller can
    /// prompt re-pairing instead of queuing data insecurely.
    pub fn resolve_for_write(&self, tier: &KeyTier) -> Result<ResolvedKey> {
        match self.resolve(tier) {
            Err(BetweenUsError::Configuration(_))
                if matches!(tier, KeyTier::Couple { pairing_id } if !pairing_id.is_empty()) =>
            {
                Err(BetweenUsError::ReconnectRequired)
            }
            result => result,
        }
    }

    /// Drop all in-memory key material. Invoked on sign-out.
    pub fn clear_cache(&self) {
        if let Ok(mut cached) = self.device_key.lock() {
            cached.take();
        }
        self.exchange.clear_cache();
    }
}
