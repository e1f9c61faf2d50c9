//! State and bundle mutations shared by the metadata versions.

use std::collections::BTreeMap;

use tresor_crypto::{
    mask, seal_client_half, server_half_id, CryptoRandom, DevicePublicKey,
    EncryptedPrivateMetadata, EphemeralPrivateKey, EphemeralPublicKey, FolderKey, ServerHalf,
    ServerHalfId, TlfPrivateKey,
};

use crate::{
    handle::FolderHandle,
    id::{FolderId, UserId},
    keybundle::{DeviceKeyInfo, KeyBundle, RemovalInfo, UserDeviceKeyInfoMap, UserDevicePublicKeys},
    metadata::DeviceKeyParams,
};

/// Fields every metadata version carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct MetadataCommon {
    pub folder: FolderId,
    pub handle: FolderHandle,
    pub serialized_private_metadata: Option<EncryptedPrivateMetadata>,
    pub private_data: Option<Vec<u8>>,
    pub tlf_private_key: Option<TlfPrivateKey>,
    /// Seal over the latest bundle, set by `finalize_rekey` and cleared by
    /// every key mutation.
    pub bundle_seal: Option<[u8; 32]>,
}

impl MetadataCommon {
    pub(super) fn new(folder: FolderId, handle: FolderHandle) -> Self {
        Self {
            folder,
            handle,
            serialized_private_metadata: None,
            private_data: None,
            tlf_private_key: None,
            bundle_seal: None,
        }
    }
}

/// How reader entries reference the reader ephemeral list.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(super) enum ReaderIndexEncoding {
    /// Pre-V3 encoding: position `p` stored as `-(p + 1)`.
    Negative,
    /// V3 encoding: position stored as-is.
    Positive,
}

fn seal_device_entry<C: CryptoRandom + ?Sized>(
    crypto: &C,
    user: UserId,
    device: &DevicePublicKey,
    index: i32,
    ephemeral_private: &EphemeralPrivateKey,
    folder_key: &FolderKey,
) -> (DeviceKeyInfo, ServerHalfId, ServerHalf) {
    let server_half = crypto.random_server_half();
    let client_half = mask(folder_key, &server_half);
    let id = server_half_id(user.as_bytes(), device, &server_half);
    let sealed =
        seal_client_half(ephemeral_private, device, &client_half, crypto.random_nonce_suffix());
    let info = DeviceKeyInfo {
        ephemeral_index: index,
        encrypted_client_half: sealed,
        server_half_id: id,
    };
    (info, id, server_half)
}

/// Adds wrappings for every expected device the bundle doesn't know yet.
///
/// Existing wrappings are left untouched; the generation's folder key does
/// not change. The shared ephemeral public key is appended to each list at
/// most once. Returns the fresh server halves for the caller to persist.
#[allow(clippy::too_many_arguments)]
pub(super) fn fill_bundle<C: CryptoRandom + ?Sized>(
    bundle: &mut KeyBundle,
    crypto: &C,
    w_keys: &UserDevicePublicKeys,
    r_keys: &UserDevicePublicKeys,
    ephemeral_public: &EphemeralPublicKey,
    ephemeral_private: &EphemeralPrivateKey,
    folder_key: &FolderKey,
    encoding: ReaderIndexEncoding,
) -> BTreeMap<ServerHalfId, ServerHalf> {
    let mut server_halves = BTreeMap::new();

    let mut writer_index: Option<i32> = None;
    for (user, devices) in w_keys {
        for device in devices {
            if bundle.writer_keys.get(user).is_some_and(|m| m.contains_key(device)) {
                continue;
            }
            let index = *writer_index.get_or_insert_with(|| {
                bundle.ephemeral_keys.push(*ephemeral_public);
                (bundle.ephemeral_keys.len() - 1) as i32
            });
            let (info, id, half) =
                seal_device_entry(crypto, *user, device, index, ephemeral_private, folder_key);
            bundle.writer_keys.entry(*user).or_default().insert(*device, info);
            server_halves.insert(id, half);
        }
    }

    let mut reader_index: Option<i32> = None;
    for (user, devices) in r_keys {
        for device in devices {
            if bundle.reader_keys.get(user).is_some_and(|m| m.contains_key(device)) {
                continue;
            }
            let index = *reader_index.get_or_insert_with(|| {
                bundle.reader_ephemeral_keys.push(*ephemeral_public);
                let position = (bundle.reader_ephemeral_keys.len() - 1) as i32;
                match encoding {
                    ReaderIndexEncoding::Negative => -(position + 1),
                    ReaderIndexEncoding::Positive => position,
                }
            });
            let (info, id, half) =
                seal_device_entry(crypto, *user, device, index, ephemeral_private, folder_key);
            bundle.reader_keys.entry(*user).or_default().insert(*device, info);
            server_halves.insert(id, half);
        }
    }

    server_halves
}

fn remove_devices_not_in(
    map: &mut UserDeviceKeyInfoMap,
    expected: &UserDevicePublicKeys,
    removal: &mut RemovalInfo,
) {
    let users: Vec<UserId> = map.keys().copied().collect();
    for user in users {
        match expected.get(&user) {
            None => {
                let Some(infos) = map.remove(&user) else { continue };
                let record = removal.entry(user).or_default();
                record.user_removed = true;
                for (device, info) in infos {
                    record
                        .device_server_half_ids
                        .entry(device)
                        .or_default()
                        .push(info.server_half_id);
                }
            }
            Some(devices) => {
                let Some(infos) = map.get_mut(&user) else { continue };
                let stale: Vec<DevicePublicKey> =
                    infos.keys().filter(|d| !devices.contains(*d)).copied().collect();
                for device in stale {
                    if let Some(info) = infos.remove(&device) {
                        removal
                            .entry(user)
                            .or_default()
                            .device_server_half_ids
                            .entry(device)
                            .or_default()
                            .push(info.server_half_id);
                    }
                }
            }
        }
    }
}

/// Drops every wrapping whose device is absent from the expected sets,
/// recording the orphaned server-half IDs for deletion.
pub(super) fn revoke_from_bundle(
    bundle: &mut KeyBundle,
    w_keys: &UserDevicePublicKeys,
    r_keys: &UserDevicePublicKeys,
    removal: &mut RemovalInfo,
) {
    remove_devices_not_in(&mut bundle.writer_keys, w_keys, removal);
    remove_devices_not_in(&mut bundle.reader_keys, r_keys, removal);
}

/// Moves a user's reader wrappings into the writer map. Returns whether the
/// user had any reader entry in this bundle.
pub(super) fn promote_in_bundle(bundle: &mut KeyBundle, user: UserId) -> bool {
    match bundle.reader_keys.remove(&user) {
        Some(infos) => {
            bundle.writer_keys.entry(user).or_default().extend(infos);
            true
        }
        None => false,
    }
}

/// Looks up one device's wrapping parameters in a bundle.
///
/// The ephemeral key list is chosen by the entry's index sign and which map
/// it lives in: non-negative writer entries use the writer list, negative
/// entries always use the reader list (including entries a promotion moved
/// into the writer map), and non-negative reader entries use the reader
/// list.
pub(super) fn params_from_bundle(
    bundle: &KeyBundle,
    user: UserId,
    device: &DevicePublicKey,
) -> Result<Option<DeviceKeyParams>, String> {
    let (info, from_reader_map) = match bundle.writer_keys.get(&user).and_then(|m| m.get(device)) {
        Some(info) => (info, false),
        None => match bundle.reader_keys.get(&user).and_then(|m| m.get(device)) {
            Some(info) => (info, true),
            None => return Ok(None),
        },
    };

    let index = info.ephemeral_index;
    let ephemeral = if index < 0 {
        bundle.reader_ephemeral_keys.get((-index - 1) as usize)
    } else if from_reader_map {
        bundle.reader_ephemeral_keys.get(index as usize)
    } else {
        bundle.ephemeral_keys.get(index as usize)
    };

    let Some(ephemeral) = ephemeral else {
        return Err(format!("ephemeral index {index} out of range"));
    };
    Ok(Some(DeviceKeyParams {
        ephemeral: *ephemeral,
        encrypted_client_half: info.encrypted_client_half.clone(),
        server_half_id: info.server_half_id,
    }))
}
