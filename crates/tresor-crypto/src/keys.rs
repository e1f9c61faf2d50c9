//! Key material value types.
//!
//! Every secret is a 32-byte newtype that zeroizes on drop and redacts its
//! `Debug` output. Public keys are plain copyable values, ordered so they can
//! key the per-user device maps in folder metadata.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of every symmetric key and key half (256 bits).
pub const KEY_SIZE: usize = 32;

/// Writes a byte slice as lowercase hex.
fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

macro_rules! secret_key_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
        pub struct $name([u8; KEY_SIZE]);

        impl $name {
            /// Wraps raw key bytes.
            pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self(bytes)
            }

            /// The raw key bytes.
            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "(..)"))
            }
        }
    };
}

macro_rules! public_key_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name([u8; KEY_SIZE]);

        impl $name {
            /// Wraps raw public key bytes.
            pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self(bytes)
            }

            /// The raw public key bytes.
            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "("))?;
                write_hex(f, &self.0[..4])?;
                write!(f, "..)")
            }
        }
    };
}

secret_key_type! {
    /// A folder's symmetric key for one generation.
    FolderKey
}

impl FolderKey {
    /// The fixed sentinel key used for public folders.
    ///
    /// Public folders carry no per-device wrappings; every reader derives
    /// this same well-known value.
    pub fn public_sentinel() -> Self {
        Self([0u8; KEY_SIZE])
    }
}

secret_key_type! {
    /// The device-sealed half of a folder key.
    ClientHalf
}

secret_key_type! {
    /// The server-stored half of a folder key.
    ServerHalf
}

secret_key_type! {
    /// The server-stored half of a single block's key.
    BlockServerHalf
}

secret_key_type! {
    /// The symmetric key protecting one block's contents.
    BlockKey
}

secret_key_type! {
    /// The long-lived private half of a device key pair.
    DevicePrivateKey
}

impl DevicePrivateKey {
    /// Derives the matching public key.
    pub fn public_key(&self) -> DevicePublicKey {
        let secret = StaticSecret::from(self.0);
        DevicePublicKey(*X25519Public::from(&secret).as_bytes())
    }
}

secret_key_type! {
    /// The private half of a per-rekey ephemeral key pair.
    EphemeralPrivateKey
}

impl EphemeralPrivateKey {
    /// Derives the matching public key.
    pub fn public_key(&self) -> EphemeralPublicKey {
        let secret = StaticSecret::from(self.0);
        EphemeralPublicKey(*X25519Public::from(&secret).as_bytes())
    }
}

secret_key_type! {
    /// The private half of a folder's asymmetric key pair.
    TlfPrivateKey
}

impl TlfPrivateKey {
    /// Derives the matching public key.
    pub fn public_key(&self) -> TlfPublicKey {
        let secret = StaticSecret::from(self.0);
        TlfPublicKey(*X25519Public::from(&secret).as_bytes())
    }
}

public_key_type! {
    /// A device's long-lived public key. Receives sealed client halves.
    DevicePublicKey
}

impl DevicePublicKey {
    /// The key's KID: a SHA-256 hash identifying the device in logs and
    /// server-side deletion calls.
    pub fn kid(&self) -> Kid {
        let digest = Sha256::digest(self.0);
        let mut kid = [0u8; KEY_SIZE];
        kid.copy_from_slice(&digest);
        Kid(kid)
    }
}

impl fmt::Display for DevicePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kid().fmt(f)
    }
}

public_key_type! {
    /// The public half of a per-rekey ephemeral key pair, stored in the
    /// bundle's ephemeral key lists.
    EphemeralPublicKey
}

public_key_type! {
    /// The public half of a folder's asymmetric key pair, stored in each
    /// generation's bundle.
    TlfPublicKey
}

/// Hash identifier for a device public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Kid([u8; KEY_SIZE]);

impl Kid {
    /// The raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kid(")?;
        write_hex(f, &self.0[..8])?;
        write!(f, ")")
    }
}

impl fmt::Display for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0[..8])
    }
}

/// Identifier for a server half on the key-halves server.
///
/// Derived by HMAC so the server never learns which folder or generation a
/// half belongs to.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerHalfId(pub(crate) [u8; KEY_SIZE]);

impl ServerHalfId {
    /// Wraps raw ID bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// The raw ID bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for ServerHalfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerHalfId(")?;
        write_hex(f, &self.0[..8])?;
        write!(f, ")")
    }
}

impl fmt::Display for ServerHalfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0[..8])
    }
}

/// A client half sealed to one device under one ephemeral key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedClientHalf {
    /// The 24-byte XChaCha20 nonce.
    pub nonce: [u8; 24],
    /// Ciphertext including the Poly1305 tag.
    pub ciphertext: Vec<u8>,
}

/// A previous generation's folder key wrapped under its successor's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedHistoricKey {
    /// The 24-byte XChaCha20 nonce.
    pub nonce: [u8; 24],
    /// Ciphertext including the Poly1305 tag.
    pub ciphertext: Vec<u8>,
}

/// Serialized private folder metadata, encrypted under the latest folder key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPrivateMetadata {
    /// The 24-byte XChaCha20 nonce.
    pub nonce: [u8; 24],
    /// Ciphertext including the Poly1305 tag.
    pub ciphertext: Vec<u8>,
}
