//! Symmetric wrapping under a folder key.
//!
//! Two users of the same construction: the historic key chain (each
//! generation's bundle wraps its predecessor's folder key) and serialized
//! private metadata (always encrypted under the latest folder key). The
//! folder key is never used as an AEAD key directly; each use derives a
//! separate key through HKDF with a distinct label.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::{
    error::CryptoError,
    keys::{EncryptedHistoricKey, EncryptedPrivateMetadata, FolderKey, KEY_SIZE},
    seal::NONCE_RANDOM_SIZE,
};

/// Label for the historic-chain wrapping key.
const HISTORIC_LABEL: &[u8] = b"tresorHistoricKeyV1";

/// Label for the private-metadata encryption key.
const PRIVATE_MD_LABEL: &[u8] = b"tresorPrivateMetadataV1";

fn derive_wrap_key(folder_key: &FolderKey, label: &[u8]) -> [u8; KEY_SIZE] {
    let hkdf = Hkdf::<Sha256>::new(None, folder_key.as_bytes());
    let mut key = [0u8; KEY_SIZE];
    let Ok(()) = hkdf.expand(label, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    key
}

/// Build a 24-byte nonce: a fixed label prefix plus a random suffix.
fn build_nonce(label: &[u8], random_suffix: [u8; NONCE_RANDOM_SIZE]) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    let n = label.len().min(16);
    nonce[..n].copy_from_slice(&label[..n]);
    nonce[16..24].copy_from_slice(&random_suffix);
    nonce
}

/// Wrap the previous generation's folder key under the current one.
///
/// Written once when a new generation is appended; the link is never
/// rewritten afterwards.
pub fn wrap_historic_key(
    curr_key: &FolderKey,
    prev_key: &FolderKey,
    random_suffix: [u8; NONCE_RANDOM_SIZE],
) -> EncryptedHistoricKey {
    let key = derive_wrap_key(curr_key, HISTORIC_LABEL);
    let nonce = build_nonce(HISTORIC_LABEL, random_suffix);

    let cipher = XChaCha20Poly1305::new((&key).into());
    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), prev_key.as_bytes().as_slice())
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    EncryptedHistoricKey { nonce, ciphertext }
}

/// Unwrap a historic chain link, recovering the previous generation's key.
///
/// # Errors
///
/// - `DecryptionFailed`: the supplied key is not the link's successor key,
///   or the link was tampered with
/// - `BadInput`: the plaintext is not exactly one key in length
pub fn unwrap_historic_key(
    curr_key: &FolderKey,
    wrapped: &EncryptedHistoricKey,
) -> Result<FolderKey, CryptoError> {
    let key = derive_wrap_key(curr_key, HISTORIC_LABEL);
    let cipher = XChaCha20Poly1305::new((&key).into());

    let plaintext = cipher
        .decrypt(XNonce::from_slice(&wrapped.nonce), wrapped.ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed { reason: "historic key link".to_string() })?;

    let bytes: [u8; KEY_SIZE] = plaintext
        .try_into()
        .map_err(|_| CryptoError::BadInput("historic key link has the wrong length".to_string()))?;
    Ok(FolderKey::from_bytes(bytes))
}

/// Encrypt serialized private metadata under a folder key.
pub fn encrypt_private_metadata(
    folder_key: &FolderKey,
    plaintext: &[u8],
    random_suffix: [u8; NONCE_RANDOM_SIZE],
) -> EncryptedPrivateMetadata {
    let key = derive_wrap_key(folder_key, PRIVATE_MD_LABEL);
    let nonce = build_nonce(PRIVATE_MD_LABEL, random_suffix);

    let cipher = XChaCha20Poly1305::new((&key).into());
    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), plaintext) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    EncryptedPrivateMetadata { nonce, ciphertext }
}

/// Decrypt serialized private metadata with a folder key.
///
/// # Errors
///
/// - `DecryptionFailed`: wrong key or tampering
pub fn decrypt_private_metadata(
    folder_key: &FolderKey,
    encrypted: &EncryptedPrivateMetadata,
) -> Result<Vec<u8>, CryptoError> {
    let key = derive_wrap_key(folder_key, PRIVATE_MD_LABEL);
    let cipher = XChaCha20Poly1305::new((&key).into());

    cipher
        .decrypt(XNonce::from_slice(&encrypted.nonce), encrypted.ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed { reason: "private metadata".to_string() })
}
