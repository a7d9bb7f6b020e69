//! Secure local credential store abstraction.
//!
//! Key material is persisted through this trait only; nothing in the crate
//! writes keys anywhere else. The default backend is the OS keychain.

use crate::crypto::{CryptoError, Result};
use std::collections::HashMap;
use std::sync::Mutex;

/// Durable, app-isolated secret storage. Assumed to survive process
/// restarts.
pub trait CredentialStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<String>>;
    fn set(&self, name: &str, value: &str) -> Result<()>;
    fn delete(&self, name: &str) -> Result<()>;
}

/// OS keychain backend (macOS Keychain, Windows Credential Manager,
/// Secret Service on Linux).
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn entry(&self, name: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, name).map_err(|e| {
            CryptoError::CredentialStore(format!("Failed to initialize keyring entry: {}", e))
        })
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new("betweenus.keys")
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self, name: &str) -> Result<Option<String>> {
        match self.entry(name)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CryptoError::CredentialStore(format!(
                "Keyring read failed: {}",
                e
            ))),
        }
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        self.entry(name)?.set_password(value).map_err(|e| {
            CryptoError::CredentialStore(format!("Keyring write failed: {}", e))
        })
    }

    fn delete(&self, name: &str) -> Result<()> {
        match self.entry(name)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(CryptoError::CredentialStore(format!(
                "Keyring delete failed: {}",
                e
            ))),
        }
    }
}

/// In-memory store for tests and ephemeral sessions. Not durable.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, name: &str) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| CryptoError::CredentialStore("Store lock poisoned".to_string()))?;
        Ok(values.get(name).cloned())
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| CryptoError::CredentialStore("Store lock poisoned".to_string()))?;
        values.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| CryptoError::CredentialStore("Store lock poisoned".to_string()))?;
        values.remove(name);
        Ok(())
    }
}
