//! Pre-historic-chain metadata: every generation keeps its full bundle.
//!
//! Reader entries use the negative ephemeral index encoding. There is no
//! historic key chain; every generation stays individually per-device
//! encrypted forever, so re-wraps and revocations touch all of them.

use std::collections::BTreeMap;

use tresor_crypto::{
    CryptoRandom, DevicePublicKey, EphemeralPrivateKey, EphemeralPublicKey, FolderKey, ServerHalf,
    ServerHalfId, TlfPublicKey,
};

use crate::{
    error::KeyError,
    handle::FolderHandle,
    id::{FolderId, KeyGen, UserId},
    keybundle::{KeyBundle, RemovalInfo, UserDeviceKeyInfoMap, UserDevicePublicKeys},
    metadata::{
        common::{
            fill_bundle, params_from_bundle, promote_in_bundle, revoke_from_bundle,
            MetadataCommon, ReaderIndexEncoding,
        },
        DeviceKeyParams,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct MetadataV2 {
    pub(super) common: MetadataCommon,
    pub(super) bundles: Vec<KeyBundle>,
}

impl MetadataV2 {
    pub(super) fn new(folder: FolderId, handle: FolderHandle) -> Self {
        Self { common: MetadataCommon::new(folder, handle), bundles: Vec::new() }
    }

    pub(super) fn latest_generation(&self) -> KeyGen {
        if self.common.folder.is_public() {
            KeyGen::PUBLIC
        } else {
            KeyGen(self.bundles.len() as i32)
        }
    }

    fn bundle(&self, gen: KeyGen) -> Result<&KeyBundle, KeyError> {
        gen.to_index()
            .and_then(|i| self.bundles.get(i))
            .ok_or(KeyError::InvalidKeyGeneration { folder: self.common.folder, generation: gen })
    }

    fn bundle_mut(&mut self, gen: KeyGen) -> Result<&mut KeyBundle, KeyError> {
        let folder = self.common.folder;
        gen.to_index()
            .and_then(|i| self.bundles.get_mut(i))
            .ok_or(KeyError::InvalidKeyGeneration { folder, generation: gen })
    }

    pub(super) fn get_device_key_params(
        &self,
        gen: KeyGen,
        user: UserId,
        device: &DevicePublicKey,
    ) -> Result<Option<DeviceKeyParams>, KeyError> {
        let bundle = self.bundle(gen)?;
        params_from_bundle(bundle, user, device)
            .map_err(|reason| KeyError::MetadataInconsistent { folder: self.common.folder, reason })
    }

    pub(super) fn get_user_device_key_info_maps(
        &self,
        gen: KeyGen,
    ) -> Result<(UserDeviceKeyInfoMap, UserDeviceKeyInfoMap), KeyError> {
        let bundle = self.bundle(gen)?;
        Ok((bundle.reader_keys.clone(), bundle.writer_keys.clone()))
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn update_key_generation<C: CryptoRandom + ?Sized>(
        &mut self,
        crypto: &C,
        gen: KeyGen,
        w_keys: &UserDevicePublicKeys,
        r_keys: &UserDevicePublicKeys,
        ephemeral_public: &EphemeralPublicKey,
        ephemeral_private: &EphemeralPrivateKey,
        folder_key: &FolderKey,
    ) -> Result<BTreeMap<ServerHalfId, ServerHalf>, KeyError> {
        let bundle = self.bundle_mut(gen)?;
        let halves = fill_bundle(
            bundle,
            crypto,
            w_keys,
            r_keys,
            ephemeral_public,
            ephemeral_private,
            folder_key,
            ReaderIndexEncoding::Negative,
        );
        self.common.bundle_seal = None;
        Ok(halves)
    }

    pub(super) fn add_key_generation(&mut self, tlf_public: TlfPublicKey) {
        self.bundles.push(KeyBundle::new(tlf_public));
        self.common.bundle_seal = None;
    }

    pub(super) fn revoke_removed_devices(
        &mut self,
        w_keys: &UserDevicePublicKeys,
        r_keys: &UserDevicePublicKeys,
    ) -> RemovalInfo {
        let mut removal = RemovalInfo::new();
        for bundle in &mut self.bundles {
            revoke_from_bundle(bundle, w_keys, r_keys, &mut removal);
        }
        self.common.bundle_seal = None;
        removal
    }

    pub(super) fn promote_reader(&mut self, user: UserId) -> Result<(), KeyError> {
        let mut moved = false;
        for bundle in &mut self.bundles {
            moved |= promote_in_bundle(bundle, user);
        }
        if !moved {
            return Err(KeyError::MetadataInconsistent {
                folder: self.common.folder,
                reason: format!("promoting {user}, who has no reader entry"),
            });
        }
        self.common.bundle_seal = None;
        Ok(())
    }

    pub(super) fn latest_bundle(&self) -> Option<&KeyBundle> {
        self.bundles.last()
    }
}
