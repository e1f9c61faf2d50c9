//! Sealing client halves to device keys.
//!
//! Each per-device wrapping is an ephemeral X25519 agreement with the
//! device's long-term key, expanded through HKDF-SHA256 into an
//! XChaCha20-Poly1305 key. One ephemeral key pair serves a whole rekey pass;
//! uniqueness comes from the per-device agreement plus a random nonce
//! suffix. All functions are pure - random bytes must be provided by the
//! caller.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::{
    error::CryptoError,
    keys::{
        ClientHalf, DevicePrivateKey, DevicePublicKey, EncryptedClientHalf, EphemeralPrivateKey,
        EphemeralPublicKey, KEY_SIZE,
    },
};

/// Size of the random suffix in the nonce (8 bytes).
pub const NONCE_RANDOM_SIZE: usize = 8;

/// Label for deriving the sealing key from the X25519 shared secret.
const SEAL_LABEL: &[u8] = b"tresorClientHalfV1";

/// Derive the AEAD key for one (ephemeral, device) pair.
fn derive_seal_key(
    shared_secret: &[u8; KEY_SIZE],
    ephemeral: &EphemeralPublicKey,
    device: &DevicePublicKey,
) -> [u8; KEY_SIZE] {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);

    // info: label || ephemeral pub || device pub
    let mut info = Vec::with_capacity(SEAL_LABEL.len() + 2 * KEY_SIZE);
    info.extend_from_slice(SEAL_LABEL);
    info.extend_from_slice(ephemeral.as_bytes());
    info.extend_from_slice(device.as_bytes());

    let mut key = [0u8; KEY_SIZE];
    let Ok(()) = hkdf.expand(&info, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    key
}

/// Build a 24-byte nonce from the key pair context and a random suffix.
///
/// - bytes 0-15: SHA-256 prefix over device pub || ephemeral pub
/// - bytes 16-23: random suffix (caller-provided)
fn build_nonce(
    device: &DevicePublicKey,
    ephemeral: &EphemeralPublicKey,
    random_suffix: [u8; NONCE_RANDOM_SIZE],
) -> [u8; 24] {
    let mut hasher = Sha256::new();
    hasher.update(device.as_bytes());
    hasher.update(ephemeral.as_bytes());
    let context = hasher.finalize();

    let mut nonce = [0u8; 24];
    nonce[0..16].copy_from_slice(&context[..16]);
    nonce[16..24].copy_from_slice(&random_suffix);
    nonce
}

/// Seal a client half to a device.
///
/// Caller MUST provide cryptographically secure random bytes in production.
pub fn seal_client_half(
    ephemeral_private: &EphemeralPrivateKey,
    device: &DevicePublicKey,
    client_half: &ClientHalf,
    random_suffix: [u8; NONCE_RANDOM_SIZE],
) -> EncryptedClientHalf {
    let secret = StaticSecret::from(*ephemeral_private.as_bytes());
    let shared = secret.diffie_hellman(&X25519Public::from(*device.as_bytes()));
    let ephemeral_public = ephemeral_private.public_key();

    let key = derive_seal_key(shared.as_bytes(), &ephemeral_public, device);
    let nonce = build_nonce(device, &ephemeral_public, random_suffix);

    let cipher = XChaCha20Poly1305::new((&key).into());
    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), client_half.as_bytes().as_slice())
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    EncryptedClientHalf { nonce, ciphertext }
}

/// Open a sealed client half with the device's private key.
///
/// # Errors
///
/// - `DecryptionFailed`: authentication failed (wrong device key, wrong
///   ephemeral key, or tampering)
/// - `BadInput`: plaintext is not exactly one key in length
pub fn open_client_half(
    device_private: &DevicePrivateKey,
    ephemeral: &EphemeralPublicKey,
    encrypted: &EncryptedClientHalf,
) -> Result<ClientHalf, CryptoError> {
    let secret = StaticSecret::from(*device_private.as_bytes());
    let shared = secret.diffie_hellman(&X25519Public::from(*ephemeral.as_bytes()));
    let device_public = device_private.public_key();

    let key = derive_seal_key(shared.as_bytes(), ephemeral, &device_public);
    let cipher = XChaCha20Poly1305::new((&key).into());

    let plaintext = cipher
        .decrypt(XNonce::from_slice(&encrypted.nonce), encrypted.ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed { reason: "client half".to_string() })?;

    let bytes: [u8; KEY_SIZE] = plaintext.try_into().map_err(|_| {
        CryptoError::BadInput("sealed client half has the wrong length".to_string())
    })?;
    Ok(ClientHalf::from_bytes(bytes))
}
