//! Folder key masking.
//!
//! A folder key is stored as two uniformly random halves whose XOR recovers
//! it. The halves live in different trust domains: the client half travels
//! sealed to member devices inside folder metadata, the server half sits on
//! the key-halves server under an HMAC-derived ID. Block keys use the same
//! construction with a per-block server half.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::keys::{
    BlockKey, BlockServerHalf, ClientHalf, DevicePublicKey, FolderKey, ServerHalf, ServerHalfId,
    KEY_SIZE,
};

type HmacSha256 = Hmac<Sha256>;

fn xor(a: &[u8; KEY_SIZE], b: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let mut out = [0u8; KEY_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// Split a folder key against a server half, producing the client half.
pub fn mask(folder_key: &FolderKey, server_half: &ServerHalf) -> ClientHalf {
    ClientHalf::from_bytes(xor(folder_key.as_bytes(), server_half.as_bytes()))
}

/// Recombine the two halves into the folder key.
pub fn unmask(server_half: &ServerHalf, client_half: &ClientHalf) -> FolderKey {
    FolderKey::from_bytes(xor(server_half.as_bytes(), client_half.as_bytes()))
}

/// Derive the key protecting one block's contents.
pub fn block_key(folder_key: &FolderKey, block_server_half: &BlockServerHalf) -> BlockKey {
    BlockKey::from_bytes(xor(folder_key.as_bytes(), block_server_half.as_bytes()))
}

/// Derive the key-halves server ID for a server half.
///
/// Keyed by the half itself over the owning user and device KID, so the ID
/// authenticates the (user, device) binding without revealing either to
/// parties that don't hold the half.
pub fn server_half_id(
    user: &[u8],
    device: &DevicePublicKey,
    server_half: &ServerHalf,
) -> ServerHalfId {
    let Ok(mut mac) = HmacSha256::new_from_slice(server_half.as_bytes()) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(user);
    mac.update(device.kid().as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut id = [0u8; KEY_SIZE];
    id.copy_from_slice(&digest);
    ServerHalfId::from_bytes(id)
}
