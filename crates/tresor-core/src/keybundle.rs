//! Per-generation key bundles and device-set diffing.
//!
//! A bundle records, for one key generation, the sealed client half for
//! every member device, split into writer and reader maps. The rekey engine
//! diffs these recorded maps against the device sets the identity service
//! currently reports, to decide between re-wrapping and a generation bump.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tresor_crypto::{
    DevicePublicKey, EncryptedClientHalf, EphemeralPublicKey, ServerHalfId, TlfPublicKey,
};

use crate::id::{FolderId, UserId};

/// One device's sealed wrapping within a bundle.
///
/// `ephemeral_index` selects the ephemeral public key the client half was
/// sealed under: non-negative indices point into the bundle's writer
/// ephemeral list, negative indices encode position `-(index + 1)` in the
/// reader ephemeral list (the pre-V3 reader encoding).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeyInfo {
    /// Index into the bundle's ephemeral key lists.
    pub ephemeral_index: i32,
    /// The client half sealed to this device.
    pub encrypted_client_half: EncryptedClientHalf,
    /// Where the matching server half lives on the key-halves server.
    pub server_half_id: ServerHalfId,
}

/// Per-device wrappings for one user.
pub type DeviceKeyInfoMap = BTreeMap<DevicePublicKey, DeviceKeyInfo>;

/// Wrappings for a whole member class (writers or readers).
pub type UserDeviceKeyInfoMap = BTreeMap<UserId, DeviceKeyInfoMap>;

/// The device sets the identity service currently reports per user.
pub type UserDevicePublicKeys = BTreeMap<UserId, BTreeSet<DevicePublicKey>>;

/// Everything recorded for one key generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    /// Writer device wrappings.
    pub writer_keys: UserDeviceKeyInfoMap,
    /// Reader device wrappings.
    pub reader_keys: UserDeviceKeyInfoMap,
    /// The folder's asymmetric public key for this generation.
    pub tlf_public_key: TlfPublicKey,
    /// Ephemeral keys referenced by writer entries.
    pub ephemeral_keys: Vec<EphemeralPublicKey>,
    /// Ephemeral keys referenced by reader entries.
    pub reader_ephemeral_keys: Vec<EphemeralPublicKey>,
}

impl KeyBundle {
    /// Creates an empty bundle for a fresh generation.
    pub fn new(tlf_public_key: TlfPublicKey) -> Self {
        Self {
            writer_keys: UserDeviceKeyInfoMap::new(),
            reader_keys: UserDeviceKeyInfoMap::new(),
            tlf_public_key,
            ephemeral_keys: Vec::new(),
            reader_ephemeral_keys: Vec::new(),
        }
    }
}

/// Per-user record of what a revocation pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRemovalInfo {
    /// Whether the user lost their last recorded device (left the folder).
    pub user_removed: bool,
    /// Orphaned server-half IDs per removed device, for server-side
    /// deletion.
    pub device_server_half_ids: BTreeMap<DevicePublicKey, Vec<ServerHalfId>>,
}

/// Removal records for every affected user.
pub type RemovalInfo = BTreeMap<UserId, DeviceRemovalInfo>;

/// Users whose expected device set contains a device the recorded map does
/// not.
///
/// A user absent from the recorded map entirely is counted too: new users
/// in the handle need wrappings at every generation.
pub fn users_with_new_devices(
    folder: &FolderId,
    key_info: &UserDeviceKeyInfoMap,
    expected: &UserDevicePublicKeys,
) -> BTreeSet<UserId> {
    let mut users = BTreeSet::new();
    for (user, devices) in expected {
        let Some(recorded) = key_info.get(user) else {
            tracing::info!(%folder, %user, "rekey: adding new user");
            users.insert(*user);
            continue;
        };
        for device in devices {
            if !recorded.contains_key(device) {
                tracing::info!(%folder, %user, device = %device.kid(), "rekey: adding new device");
                users.insert(*user);
                break;
            }
        }
    }
    users
}

/// Users with a recorded device the expected set no longer contains.
///
/// A user absent from the expected set entirely is counted too: their
/// remaining wrappings are all stale.
pub fn users_with_removed_devices(
    folder: &FolderId,
    key_info: &UserDeviceKeyInfoMap,
    expected: &UserDevicePublicKeys,
) -> BTreeSet<UserId> {
    let mut users = BTreeSet::new();
    for (user, recorded) in key_info {
        let Some(devices) = expected.get(user) else {
            tracing::info!(%folder, %user, "rekey: removing user");
            users.insert(*user);
            continue;
        };
        for device in recorded.keys() {
            if !devices.contains(device) {
                tracing::info!(%folder, %user, device = %device.kid(), "rekey: removing device");
                users.insert(*user);
                break;
            }
        }
    }
    users
}
