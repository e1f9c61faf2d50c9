//! Tresor Cryptographic Primitives
//!
//! Cryptographic building blocks for the tresor key-management core. Pure
//! functions with deterministic outputs. Callers provide random bytes for
//! deterministic testing.
//!
//! # Key Lifecycle
//!
//! Every encrypted folder carries a rolling sequence of 32-byte folder keys,
//! one per key generation. A folder key is never stored whole: it is split
//! into a client half and a server half whose XOR recovers the key. The
//! client half is sealed to each member device's long-term key; the server
//! half lives on the key-halves server under an HMAC-derived ID.
//!
//! ```text
//! Folder Key (per generation)
//!        │
//!        ├─ XOR mask → Client Half ── X25519 + AEAD seal → per-device wrapping
//!        │             Server Half ── HMAC-SHA256 id ────→ key-halves server
//!        │
//!        ├─ AEAD wrap under successor key → historic chain link
//!        │
//!        └─ XOR with block server half → per-block key
//! ```
//!
//! # Security
//!
//! Two-secret split:
//! - Neither half alone reveals the folder key
//! - Compromising a device key still requires the server half
//! - Deleting the server half retires a wrapping without touching the device
//!
//! Device isolation:
//! - Each wrapping is sealed under a fresh ephemeral X25519 key
//! - Compromising one device's wrapping doesn't expose other devices'
//!
//! Historic access:
//! - Each generation's bundle wraps the previous generation's key
//! - Holding the latest key is sufficient to walk back to any older one

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
mod facade;
mod keys;
mod mask;
mod seal;
mod wrap;

pub use error::CryptoError;
pub use facade::{CandidateClientHalf, Crypto, CryptoRandom, LocalCrypto};
pub use keys::{
    BlockKey, BlockServerHalf, ClientHalf, DevicePrivateKey, DevicePublicKey, EncryptedClientHalf,
    EncryptedHistoricKey, EncryptedPrivateMetadata, EphemeralPrivateKey, EphemeralPublicKey,
    FolderKey, Kid, ServerHalf, ServerHalfId, TlfPrivateKey, TlfPublicKey, KEY_SIZE,
};
pub use mask::{block_key, mask, server_half_id, unmask};
pub use seal::{open_client_half, seal_client_half, NONCE_RANDOM_SIZE};
pub use wrap::{
    decrypt_private_metadata, encrypt_private_metadata, unwrap_historic_key, wrap_historic_key,
};
