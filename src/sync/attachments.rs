//! Attachment blob encryption and upload glue.
//!
//! Blob bytes never travel through the relational store; they are sealed
//! with the couple key and uploaded to object storage by an
//! [`AttachmentUploader`]. The relational `attachments` row carries only
//! metadata (storage path, nonce, content type) and synchronizes like any
//! other table.

use crate::crypto::keys::SymmetricKey;
use crate::crypto::{CryptoError, Result as CryptoResult};
use async_trait::async_trait;
use crypto_secretbox::aead::{Aead, AeadCore, KeyInit, OsRng};
use crypto_secretbox::XSalsa20Poly1305;

/// XSalsa20-Poly1305 nonce length for blob sealing.
pub const BLOB_NONCE_LEN: usize = 24;

/// Seal attachment bytes with a fresh random nonce. The nonce travels
/// out of band, in the attachment row's metadata, not inside the blob.
pub fn encrypt_bytes(
    plaintext: &[u8],
    key: &SymmetricKey,
) -> CryptoResult<(Vec<u8>, [u8; BLOB_NONCE_LEN])> {
    let cipher = XSalsa20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            got: key.as_bytes().len(),
        })?;
    let nonce = XSalsa20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(format!("Blob seal failed: {}", e)))?;

    let mut nonce_bytes = [0u8; BLOB_NONCE_LEN];
    nonce_bytes.copy_from_slice(&nonce);
    Ok((ciphertext, nonce_bytes))
}

/// Open a sealed attachment blob.
pub fn decrypt_bytes(
    ciphertext: &[u8],
    nonce: &[u8; BLOB_NONCE_LEN],
    key: &SymmetricKey,
) -> CryptoResult<Vec<u8>> {
    let cipher = XSalsa20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            got: key.as_bytes().len(),
        })?;
    cipher
        .decrypt(nonce.into(), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Uploads locally captured blobs to object storage, then updates their
/// `attachments` rows with the storage path so the rows can push.
///
/// Implementations live with the transport layer; the engine calls
/// [`AttachmentUploader::process_pending`] between the pull phase and the
/// follow-up push of the `attachments` table.
#[async_trait]
pub trait AttachmentUploader: Send + Sync {
    /// Upload every blob awaiting transfer. Returns how many uploaded.
    async fn process_pending(&self) -> crate::Result<usize>;
}
