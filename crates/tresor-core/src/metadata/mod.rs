//! A folder's key metadata: versioned bundles behind one capability trait.
//!
//! The resolver and the rekey engine never see a concrete metadata layout;
//! they operate on [`KeyMetadata`]. [`RootMetadata`] is the locally-owned,
//! mutable implementation, a tagged variant over the two wire formats:
//!
//! - V2 keeps a full bundle per generation and encodes reader entries with
//!   negative ephemeral indices.
//! - V3 keeps only the latest generation's bundle plus a historic key
//!   chain, and uses positive indices throughout.
//!
//! The V2-vs-V3 branch lives here, in the variant - not at call sites.
//! Mutating operations have default implementations that refuse with
//! [`KeyError::MutableMetadataNotImpl`], so metadata received from an
//! untrusted source can satisfy the trait without being mutable.

mod common;
mod v2;
mod v3;

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use tresor_crypto::{
    CryptoRandom, DevicePublicKey, EncryptedClientHalf, EncryptedPrivateMetadata,
    EphemeralPrivateKey, EphemeralPublicKey, FolderKey, ServerHalf, ServerHalfId, TlfPrivateKey,
    TlfPublicKey,
};

use crate::{
    codec,
    error::KeyError,
    handle::FolderHandle,
    id::{FolderId, KeyGen, UserId},
    keybundle::{RemovalInfo, UserDeviceKeyInfoMap, UserDevicePublicKeys},
};

use self::{v2::MetadataV2, v3::MetadataV3};

/// Metadata wire-format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MetadataVersion {
    /// Per-generation bundles, negative reader indices, no historic chain.
    V2,
    /// Latest-only bundle with a historic key chain.
    V3,
}

/// One device's wrapping parameters, as handed to the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceKeyParams {
    /// The ephemeral key the client half was sealed under.
    pub ephemeral: EphemeralPublicKey,
    /// The sealed client half.
    pub encrypted_client_half: EncryptedClientHalf,
    /// Where the matching server half lives.
    pub server_half_id: ServerHalfId,
}

/// Read (and, for mutable implementations, write) access to a folder's key
/// metadata.
///
/// # Errors
///
/// Mutating operations default to [`KeyError::MutableMetadataNotImpl`];
/// only locally-owned metadata overrides them.
pub trait KeyMetadata: Send + Sync {
    /// The folder this metadata belongs to.
    fn tlf_id(&self) -> FolderId;

    /// The newest key generation, [`KeyGen::PUBLIC`] for public folders,
    /// [`KeyGen::UNSET`] before the first rekey.
    fn latest_generation(&self) -> KeyGen;

    /// The metadata wire-format version.
    fn version(&self) -> MetadataVersion;

    /// Whether historic folder keys are stored in a chain (V3 and later).
    fn stores_historic_keys(&self) -> bool;

    /// The folder's member handle.
    fn handle(&self) -> &FolderHandle;

    /// Whether the private metadata is usable (decrypted or absent).
    fn is_readable(&self) -> bool;

    /// One device's wrapping parameters at a generation.
    ///
    /// Returns `Ok(None)` when the generation has per-device wrappings but
    /// none for this device.
    ///
    /// # Errors
    ///
    /// - `NotPerDeviceEncrypted`: historic generation in V3 metadata;
    ///   recover through the chain instead
    /// - `InvalidKeyGeneration`: generation out of range
    fn get_device_key_params(
        &self,
        gen: KeyGen,
        user: UserId,
        device: &DevicePublicKey,
    ) -> Result<Option<DeviceKeyParams>, KeyError>;

    /// The full `(readers, writers)` wrapping maps at a generation.
    ///
    /// # Errors
    ///
    /// Same as [`Self::get_device_key_params`].
    fn get_user_device_key_info_maps(
        &self,
        gen: KeyGen,
    ) -> Result<(UserDeviceKeyInfoMap, UserDeviceKeyInfoMap), KeyError>;

    /// Recovers a historic generation's key by walking the chain down from
    /// the latest generation's key.
    fn get_historic_folder_key(
        &self,
        gen: KeyGen,
        latest_key: &FolderKey,
    ) -> Result<FolderKey, KeyError>;

    /// Re-wraps one generation's (unchanged) folder key for an altered
    /// device set, returning the fresh server halves to persist.
    #[allow(clippy::too_many_arguments)]
    fn update_key_generation<C: CryptoRandom + ?Sized>(
        &mut self,
        crypto: &C,
        gen: KeyGen,
        w_keys: &UserDevicePublicKeys,
        r_keys: &UserDevicePublicKeys,
        ephemeral_public: &EphemeralPublicKey,
        ephemeral_private: &EphemeralPrivateKey,
        folder_key: &FolderKey,
    ) -> Result<BTreeMap<ServerHalfId, ServerHalf>, KeyError> {
        let _ = (crypto, gen, w_keys, r_keys, ephemeral_public, ephemeral_private, folder_key);
        Err(KeyError::MutableMetadataNotImpl)
    }

    /// Appends a fresh key generation, extending the historic chain when
    /// the version stores one.
    fn add_key_generation<C: CryptoRandom + ?Sized>(
        &mut self,
        crypto: &C,
        prev_key: Option<&FolderKey>,
        new_key: &FolderKey,
        tlf_public: TlfPublicKey,
    ) -> Result<(), KeyError> {
        let _ = (crypto, prev_key, new_key, tlf_public);
        Err(KeyError::MutableMetadataNotImpl)
    }

    /// Drops every wrapping for devices absent from the expected sets,
    /// across all stored generations, returning the orphaned server-half
    /// IDs for deletion.
    fn revoke_removed_devices(
        &mut self,
        w_keys: &UserDevicePublicKeys,
        r_keys: &UserDevicePublicKeys,
    ) -> Result<RemovalInfo, KeyError> {
        let _ = (w_keys, r_keys);
        Err(KeyError::MutableMetadataNotImpl)
    }

    /// Moves a user's reader wrappings into the writer bundles.
    fn promote_reader(&mut self, user: UserId) -> Result<(), KeyError> {
        let _ = user;
        Err(KeyError::MutableMetadataNotImpl)
    }

    /// Seals the latest bundle after a rekey.
    fn finalize_rekey(&mut self) -> Result<(), KeyError> {
        Err(KeyError::MutableMetadataNotImpl)
    }

    /// Replaces the stored handle with a re-resolved one.
    fn update_from_tlf_handle(&mut self, handle: &FolderHandle) -> Result<(), KeyError> {
        let _ = handle;
        Err(KeyError::MutableMetadataNotImpl)
    }

    /// Decrypts the serialized private metadata with the latest folder key.
    ///
    /// A no-op when already readable.
    fn decrypt_private_metadata(&mut self, latest_key: &FolderKey) -> Result<(), KeyError> {
        let _ = latest_key;
        Err(KeyError::MutableMetadataNotImpl)
    }

    /// Stores the private half of a freshly generated folder key pair.
    fn set_tlf_private_key(&mut self, key: TlfPrivateKey) -> Result<(), KeyError> {
        let _ = key;
        Err(KeyError::MutableMetadataNotImpl)
    }
}

/// Locally-owned, mutable folder key metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootMetadata {
    inner: Inner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Inner {
    V2(MetadataV2),
    V3(MetadataV3),
}

impl RootMetadata {
    /// Creates empty metadata for a folder at the given version.
    pub fn new(version: MetadataVersion, folder: FolderId, handle: FolderHandle) -> Self {
        let inner = match version {
            MetadataVersion::V2 => Inner::V2(MetadataV2::new(folder, handle)),
            MetadataVersion::V3 => Inner::V3(MetadataV3::new(folder, handle)),
        };
        Self { inner }
    }

    fn common(&self) -> &common::MetadataCommon {
        match &self.inner {
            Inner::V2(md) => &md.common,
            Inner::V3(md) => &md.common,
        }
    }

    fn common_mut(&mut self) -> &mut common::MetadataCommon {
        match &mut self.inner {
            Inner::V2(md) => &mut md.common,
            Inner::V3(md) => &mut md.common,
        }
    }

    fn latest_bundle(&self) -> Option<&crate::keybundle::KeyBundle> {
        match &self.inner {
            Inner::V2(md) => md.latest_bundle(),
            Inner::V3(md) => md.latest_bundle(),
        }
    }

    /// Whether the latest bundle carries a rekey seal.
    pub fn is_finalized(&self) -> bool {
        self.common().bundle_seal.is_some()
    }

    /// The decrypted private metadata, if present.
    pub fn private_data(&self) -> Option<&[u8]> {
        self.common().private_data.as_deref()
    }

    /// The stored private folder key, if a rekey produced one.
    pub fn tlf_private_key(&self) -> Option<&TlfPrivateKey> {
        self.common().tlf_private_key.as_ref()
    }

    /// Attaches serialized private metadata (encrypted under the latest
    /// folder key).
    pub fn set_serialized_private_metadata(&mut self, encrypted: EncryptedPrivateMetadata) {
        let common = self.common_mut();
        common.serialized_private_metadata = Some(encrypted);
        common.private_data = None;
    }
}

impl KeyMetadata for RootMetadata {
    fn tlf_id(&self) -> FolderId {
        self.common().folder
    }

    fn latest_generation(&self) -> KeyGen {
        match &self.inner {
            Inner::V2(md) => md.latest_generation(),
            Inner::V3(md) => md.latest_generation(),
        }
    }

    fn version(&self) -> MetadataVersion {
        match &self.inner {
            Inner::V2(_) => MetadataVersion::V2,
            Inner::V3(_) => MetadataVersion::V3,
        }
    }

    fn stores_historic_keys(&self) -> bool {
        matches!(self.inner, Inner::V3(_))
    }

    fn handle(&self) -> &FolderHandle {
        &self.common().handle
    }

    fn is_readable(&self) -> bool {
        let common = self.common();
        common.folder.is_public()
            || common.serialized_private_metadata.is_none()
            || common.private_data.is_some()
    }

    fn get_device_key_params(
        &self,
        gen: KeyGen,
        user: UserId,
        device: &DevicePublicKey,
    ) -> Result<Option<DeviceKeyParams>, KeyError> {
        match &self.inner {
            Inner::V2(md) => md.get_device_key_params(gen, user, device),
            Inner::V3(md) => md.get_device_key_params(gen, user, device),
        }
    }

    fn get_user_device_key_info_maps(
        &self,
        gen: KeyGen,
    ) -> Result<(UserDeviceKeyInfoMap, UserDeviceKeyInfoMap), KeyError> {
        match &self.inner {
            Inner::V2(md) => md.get_user_device_key_info_maps(gen),
            Inner::V3(md) => md.get_user_device_key_info_maps(gen),
        }
    }

    fn get_historic_folder_key(
        &self,
        gen: KeyGen,
        latest_key: &FolderKey,
    ) -> Result<FolderKey, KeyError> {
        match &self.inner {
            Inner::V2(md) => Err(KeyError::MetadataInconsistent {
                folder: md.common.folder,
                reason: "metadata version stores no historic keys".to_string(),
            }),
            Inner::V3(md) => md.get_historic_folder_key(gen, latest_key),
        }
    }

    fn update_key_generation<C: CryptoRandom + ?Sized>(
        &mut self,
        crypto: &C,
        gen: KeyGen,
        w_keys: &UserDevicePublicKeys,
        r_keys: &UserDevicePublicKeys,
        ephemeral_public: &EphemeralPublicKey,
        ephemeral_private: &EphemeralPrivateKey,
        folder_key: &FolderKey,
    ) -> Result<BTreeMap<ServerHalfId, ServerHalf>, KeyError> {
        match &mut self.inner {
            Inner::V2(md) => md.update_key_generation(
                crypto,
                gen,
                w_keys,
                r_keys,
                ephemeral_public,
                ephemeral_private,
                folder_key,
            ),
            Inner::V3(md) => md.update_key_generation(
                crypto,
                gen,
                w_keys,
                r_keys,
                ephemeral_public,
                ephemeral_private,
                folder_key,
            ),
        }
    }

    fn add_key_generation<C: CryptoRandom + ?Sized>(
        &mut self,
        crypto: &C,
        prev_key: Option<&FolderKey>,
        new_key: &FolderKey,
        tlf_public: TlfPublicKey,
    ) -> Result<(), KeyError> {
        if self.tlf_id().is_public() {
            return Err(KeyError::MetadataInconsistent {
                folder: self.tlf_id(),
                reason: "public folders have no key generations".to_string(),
            });
        }
        match &mut self.inner {
            Inner::V2(md) => {
                md.add_key_generation(tlf_public);
                Ok(())
            }
            Inner::V3(md) => md.add_key_generation(crypto, prev_key, new_key, tlf_public),
        }
    }

    fn revoke_removed_devices(
        &mut self,
        w_keys: &UserDevicePublicKeys,
        r_keys: &UserDevicePublicKeys,
    ) -> Result<RemovalInfo, KeyError> {
        match &mut self.inner {
            Inner::V2(md) => Ok(md.revoke_removed_devices(w_keys, r_keys)),
            Inner::V3(md) => Ok(md.revoke_removed_devices(w_keys, r_keys)),
        }
    }

    fn promote_reader(&mut self, user: UserId) -> Result<(), KeyError> {
        match &mut self.inner {
            Inner::V2(md) => md.promote_reader(user),
            Inner::V3(md) => md.promote_reader(user),
        }
    }

    fn finalize_rekey(&mut self) -> Result<(), KeyError> {
        let generation = self.latest_generation();
        let Some(bundle) = self.latest_bundle() else {
            return Err(KeyError::MetadataInconsistent {
                folder: self.tlf_id(),
                reason: "no key generation to finalize".to_string(),
            });
        };
        let encoded = codec::encode(bundle)?;

        let mut hasher = Sha256::new();
        hasher.update(encoded);
        hasher.update(generation.0.to_be_bytes());
        let digest = hasher.finalize();

        let mut seal = [0u8; 32];
        seal.copy_from_slice(&digest);
        self.common_mut().bundle_seal = Some(seal);
        Ok(())
    }

    fn update_from_tlf_handle(&mut self, handle: &FolderHandle) -> Result<(), KeyError> {
        self.common_mut().handle = handle.clone();
        Ok(())
    }

    fn decrypt_private_metadata(&mut self, latest_key: &FolderKey) -> Result<(), KeyError> {
        if self.is_readable() {
            return Ok(());
        }
        let common = self.common_mut();
        if let Some(encrypted) = &common.serialized_private_metadata {
            let data = tresor_crypto::decrypt_private_metadata(latest_key, encrypted)?;
            common.private_data = Some(data);
        }
        Ok(())
    }

    fn set_tlf_private_key(&mut self, key: TlfPrivateKey) -> Result<(), KeyError> {
        self.common_mut().tlf_private_key = Some(key);
        Ok(())
    }
}

/// Metadata fetched from an untrusted source.
///
/// Readable like any metadata, but every mutating operation refuses with
/// [`KeyError::MutableMetadataNotImpl`]: local rekeys must start from
/// locally-owned metadata.
#[derive(Debug, Clone)]
pub struct UntrustedRootMetadata(RootMetadata);

impl UntrustedRootMetadata {
    /// Wraps metadata as untrusted.
    pub fn new(md: RootMetadata) -> Self {
        Self(md)
    }
}

impl KeyMetadata for UntrustedRootMetadata {
    fn tlf_id(&self) -> FolderId {
        self.0.tlf_id()
    }

    fn latest_generation(&self) -> KeyGen {
        self.0.latest_generation()
    }

    fn version(&self) -> MetadataVersion {
        self.0.version()
    }

    fn stores_historic_keys(&self) -> bool {
        self.0.stores_historic_keys()
    }

    fn handle(&self) -> &FolderHandle {
        self.0.handle()
    }

    fn is_readable(&self) -> bool {
        self.0.is_readable()
    }

    fn get_device_key_params(
        &self,
        gen: KeyGen,
        user: UserId,
        device: &DevicePublicKey,
    ) -> Result<Option<DeviceKeyParams>, KeyError> {
        self.0.get_device_key_params(gen, user, device)
    }

    fn get_user_device_key_info_maps(
        &self,
        gen: KeyGen,
    ) -> Result<(UserDeviceKeyInfoMap, UserDeviceKeyInfoMap), KeyError> {
        self.0.get_user_device_key_info_maps(gen)
    }

    fn get_historic_folder_key(
        &self,
        gen: KeyGen,
        latest_key: &FolderKey,
    ) -> Result<FolderKey, KeyError> {
        self.0.get_historic_folder_key(gen, latest_key)
    }
}
