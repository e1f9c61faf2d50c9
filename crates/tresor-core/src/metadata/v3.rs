//! Historic-chain metadata: only the latest generation keeps its bundle.
//!
//! Earlier generations carry no per-device wrappings at all; their keys are
//! recovered by walking the historic chain down from the latest key. Reader
//! entries use plain positive indices into the reader ephemeral list.

use std::collections::BTreeMap;

use tresor_crypto::{
    unwrap_historic_key, wrap_historic_key, CryptoRandom, DevicePublicKey, EncryptedHistoricKey,
    EphemeralPrivateKey, EphemeralPublicKey, FolderKey, ServerHalf, ServerHalfId, TlfPublicKey,
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
pub(super) struct MetadataV3 {
    pub(super) common: MetadataCommon,
    generation_count: i32,
    latest_bundle: Option<KeyBundle>,
    /// Chain links, append-only and dense: entry `i` holds generation
    /// `i + 1`'s key wrapped under generation `i + 2`'s key.
    historic_keys: Vec<EncryptedHistoricKey>,
}

impl MetadataV3 {
    pub(super) fn new(folder: FolderId, handle: FolderHandle) -> Self {
        Self {
            common: MetadataCommon::new(folder, handle),
            generation_count: 0,
            latest_bundle: None,
            historic_keys: Vec::new(),
        }
    }

    pub(super) fn latest_generation(&self) -> KeyGen {
        if self.common.folder.is_public() {
            KeyGen::PUBLIC
        } else {
            KeyGen(self.generation_count)
        }
    }

    /// Classifies a generation: `Ok(true)` is the latest, `Ok(false)` is a
    /// valid historic one.
    fn classify(&self, gen: KeyGen) -> Result<bool, KeyError> {
        if gen < KeyGen::FIRST_VALID || gen > self.latest_generation() {
            return Err(KeyError::InvalidKeyGeneration {
                folder: self.common.folder,
                generation: gen,
            });
        }
        Ok(gen == self.latest_generation())
    }

    fn latest_bundle_ref(&self) -> Result<&KeyBundle, KeyError> {
        self.latest_bundle.as_ref().ok_or(KeyError::MetadataInconsistent {
            folder: self.common.folder,
            reason: "latest generation has no bundle".to_string(),
        })
    }

    pub(super) fn get_device_key_params(
        &self,
        gen: KeyGen,
        user: UserId,
        device: &DevicePublicKey,
    ) -> Result<Option<DeviceKeyParams>, KeyError> {
        if !self.classify(gen)? {
            return Err(KeyError::NotPerDeviceEncrypted {
                folder: self.common.folder,
                generation: gen,
            });
        }
        params_from_bundle(self.latest_bundle_ref()?, user, device)
            .map_err(|reason| KeyError::MetadataInconsistent { folder: self.common.folder, reason })
    }

    pub(super) fn get_user_device_key_info_maps(
        &self,
        gen: KeyGen,
    ) -> Result<(UserDeviceKeyInfoMap, UserDeviceKeyInfoMap), KeyError> {
        if !self.classify(gen)? {
            return Err(KeyError::NotPerDeviceEncrypted {
                folder: self.common.folder,
                generation: gen,
            });
        }
        let bundle = self.latest_bundle_ref()?;
        Ok((bundle.reader_keys.clone(), bundle.writer_keys.clone()))
    }

    pub(super) fn get_historic_folder_key(
        &self,
        gen: KeyGen,
        latest_key: &FolderKey,
    ) -> Result<FolderKey, KeyError> {
        let latest = self.latest_generation();
        if gen < KeyGen::FIRST_VALID || gen >= latest {
            return Err(KeyError::InvalidKeyGeneration {
                folder: self.common.folder,
                generation: gen,
            });
        }

        let mut key = latest_key.clone();
        let mut at = latest;
        while at > gen {
            let link = self.historic_keys.get((at.0 - 2) as usize).ok_or_else(|| {
                KeyError::MetadataInconsistent {
                    folder: self.common.folder,
                    reason: format!("historic chain has no link for generation {at}"),
                }
            })?;
            key = unwrap_historic_key(&key, link)?;
            at = at.prev();
        }
        Ok(key)
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
        if !self.classify(gen)? {
            return Err(KeyError::NotPerDeviceEncrypted {
                folder: self.common.folder,
                generation: gen,
            });
        }
        let folder = self.common.folder;
        let bundle = self.latest_bundle.as_mut().ok_or(KeyError::MetadataInconsistent {
            folder,
            reason: "latest generation has no bundle".to_string(),
        })?;
        let halves = fill_bundle(
            bundle,
            crypto,
            w_keys,
            r_keys,
            ephemeral_public,
            ephemeral_private,
            folder_key,
            ReaderIndexEncoding::Positive,
        );
        self.common.bundle_seal = None;
        Ok(halves)
    }

    /// Appends a fresh generation, chaining the previous key when one
    /// exists.
    pub(super) fn add_key_generation<C: CryptoRandom + ?Sized>(
        &mut self,
        crypto: &C,
        prev_key: Option<&FolderKey>,
        new_key: &FolderKey,
        tlf_public: TlfPublicKey,
    ) -> Result<(), KeyError> {
        if self.generation_count >= 1 {
            let prev = prev_key.ok_or(KeyError::MetadataInconsistent {
                folder: self.common.folder,
                reason: "previous folder key required to extend the historic chain".to_string(),
            })?;
            self.historic_keys.push(wrap_historic_key(
                new_key,
                prev,
                crypto.random_nonce_suffix(),
            ));
        }
        self.latest_bundle = Some(KeyBundle::new(tlf_public));
        self.generation_count += 1;
        self.common.bundle_seal = None;
        Ok(())
    }

    pub(super) fn revoke_removed_devices(
        &mut self,
        w_keys: &UserDevicePublicKeys,
        r_keys: &UserDevicePublicKeys,
    ) -> RemovalInfo {
        let mut removal = RemovalInfo::new();
        if let Some(bundle) = self.latest_bundle.as_mut() {
            revoke_from_bundle(bundle, w_keys, r_keys, &mut removal);
        }
        self.common.bundle_seal = None;
        removal
    }

    pub(super) fn promote_reader(&mut self, user: UserId) -> Result<(), KeyError> {
        let moved = self.latest_bundle.as_mut().is_some_and(|b| promote_in_bundle(b, user));
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
        self.latest_bundle.as_ref()
    }
}
