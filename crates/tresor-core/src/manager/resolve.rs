//! Folder key resolution.
//!
//! `get_folder_key` walks: public short-circuit → generation validation →
//! cache probe → per-device unwrap → server-half unmask, falling back to
//! historic-chain recovery for generations that no longer carry per-device
//! wrappings. Cache writes happen only after a successful unmask.

use tresor_crypto::{
    unmask, CandidateClientHalf, ClientHalf, Crypto, CryptoError, DevicePublicKey, FolderKey,
    ServerHalfId,
};

use crate::{
    error::KeyError,
    id::{BlockPointer, KeyGen, UserInfo},
    manager::{KeyLookupFlags, KeyManager},
    metadata::KeyMetadata,
    services::{IdentityService, KeyHalfStore, MetadataOps},
};

impl<C, I, K, M> KeyManager<C, I, K, M>
where
    C: Crypto,
    I: IdentityService,
    K: KeyHalfStore,
    M: MetadataOps,
{
    /// The latest generation's key, for encrypting new content. Not
    /// cached: the write path already holds the metadata that will carry
    /// the ciphertext.
    pub async fn get_folder_key_for_encryption<MD: KeyMetadata>(
        &self,
        md: &MD,
    ) -> Result<FolderKey, KeyError> {
        self.get_folder_key(md, md.latest_generation(), KeyLookupFlags::NONE).await
    }

    /// The key for decrypting another metadata object's private contents,
    /// resolved through metadata that carries wrappings for it. Tries
    /// every device of the calling user and caches the result.
    pub async fn get_folder_key_for_md_decryption<MD, MK>(
        &self,
        md_to_decrypt: &MD,
        md_with_keys: &MK,
    ) -> Result<FolderKey, KeyError>
    where
        MD: KeyMetadata,
        MK: KeyMetadata,
    {
        self.get_folder_key(
            md_with_keys,
            md_to_decrypt.latest_generation(),
            KeyLookupFlags::ANY_DEVICE | KeyLookupFlags::DO_CACHE,
        )
        .await
    }

    /// The key for decrypting one block, at the generation recorded in its
    /// pointer. Current device only; caches the result.
    pub async fn get_folder_key_for_block_decryption<MD: KeyMetadata>(
        &self,
        md: &MD,
        block: &BlockPointer,
    ) -> Result<FolderKey, KeyError> {
        self.get_folder_key(md, block.key_gen, KeyLookupFlags::DO_CACHE).await
    }

    /// Every generation's key, dense from the first valid generation to
    /// the latest. Empty for public folders.
    pub async fn get_folder_keys_all_generations<MD: KeyMetadata>(
        &self,
        md: &MD,
    ) -> Result<Vec<FolderKey>, KeyError> {
        let mut keys = Vec::new();
        let mut gen = KeyGen::FIRST_VALID;
        while gen <= md.latest_generation() {
            keys.push(self.get_folder_key(md, gen, KeyLookupFlags::DO_CACHE).await?);
            gen = gen.next();
        }
        Ok(keys)
    }

    /// Resolves one generation's folder key.
    pub(crate) async fn get_folder_key<MD: KeyMetadata>(
        &self,
        md: &MD,
        gen: KeyGen,
        flags: KeyLookupFlags,
    ) -> Result<FolderKey, KeyError> {
        let folder = md.tlf_id();

        if folder.is_public() {
            return Ok(FolderKey::public_sentinel());
        }

        if gen < KeyGen::FIRST_VALID {
            return Err(KeyError::InvalidKeyGeneration { folder, generation: gen });
        }
        // A generation we haven't seen should be impossible: the caller
        // must have observed the metadata that introduced it. Failsafe.
        if gen > md.latest_generation() {
            return Err(KeyError::NewKeyGeneration { folder, generation: gen });
        }

        if let Ok(key) = self.cache.get(folder, gen) {
            return Ok(key);
        }

        // Fill barrier: a concurrent resolver for the same pair may have
        // published the key while we waited.
        let _permit = self.cache.lock_fill(folder, gen).await;
        if let Ok(key) = self.cache.get(folder, gen) {
            return Ok(key);
        }

        let user = self.identity.current_user().await?;

        let key = match self.folder_key_params(md, gen, &user, flags).await {
            Err(KeyError::NotPerDeviceEncrypted { .. }) => {
                // Historic recovery: derive the latest generation's key,
                // then walk the chain down to the requested one.
                let latest_gen = md.latest_generation();
                let latest_key = match self.cache.get(folder, latest_gen) {
                    Ok(key) => key,
                    Err(_) => {
                        let (client_half, half_id, device) =
                            self.folder_key_params(md, latest_gen, &user, flags).await?;
                        self.unmask_with_server_half(half_id, device, client_half).await?
                    }
                };
                md.get_historic_folder_key(gen, &latest_key)?
            }
            Err(err) => return Err(err),
            Ok((client_half, half_id, device)) => {
                self.unmask_with_server_half(half_id, device, client_half).await?
            }
        };

        if flags.contains(KeyLookupFlags::DO_CACHE) {
            self.cache.put(folder, gen, key.clone());
        }
        Ok(key)
    }

    /// Finds and opens the caller's wrapping at one generation, returning
    /// the client half, the matching server-half ID, and the device whose
    /// key opened it.
    async fn folder_key_params<MD: KeyMetadata>(
        &self,
        md: &MD,
        gen: KeyGen,
        user: &UserInfo,
        flags: KeyLookupFlags,
    ) -> Result<(ClientHalf, ServerHalfId, DevicePublicKey), KeyError> {
        if flags.contains(KeyLookupFlags::ANY_DEVICE) {
            let devices = self.identity.device_keys(user.uid).await?;

            let mut candidates = Vec::with_capacity(devices.len());
            let mut half_ids = Vec::with_capacity(devices.len());
            let mut device_lookup = Vec::with_capacity(devices.len());
            for (index, device) in devices.iter().enumerate() {
                match md.get_device_key_params(gen, user.uid, device) {
                    Err(err @ KeyError::NotPerDeviceEncrypted { .. }) => return Err(err),
                    Err(err) => {
                        tracing::debug!(
                            %gen, device = %device.kid(), error = %err,
                            "skipping device: params lookup failed"
                        );
                        continue;
                    }
                    Ok(None) => {
                        tracing::debug!(
                            %gen, device = %device.kid(),
                            "skipping device: no key info"
                        );
                        continue;
                    }
                    Ok(Some(params)) => {
                        half_ids.push(params.server_half_id);
                        candidates.push(CandidateClientHalf {
                            device: *device,
                            ephemeral: params.ephemeral,
                            encrypted: params.encrypted_client_half,
                        });
                        device_lookup.push(index);
                    }
                }
            }
            if candidates.is_empty() {
                return Err(self.make_rekey_read_error(md, gen, user));
            }

            let prompt = flags.contains(KeyLookupFlags::PROMPT_PAPER);
            match self.crypto.decrypt_client_half_any(candidates, prompt).await {
                Ok((client_half, index)) => {
                    Ok((client_half, half_ids[index], devices[device_lookup[index]]))
                }
                Err(
                    err @ (CryptoError::DecryptionFailed { .. } | CryptoError::NoSecretKey { .. }),
                ) => {
                    tracing::debug!(%gen, error = %err, "no candidate wrapping opened");
                    Err(self.make_rekey_read_error(md, gen, user))
                }
                Err(err) => Err(err.into()),
            }
        } else {
            let device = self.identity.current_device_key().await?;
            match md.get_device_key_params(gen, user.uid, &device)? {
                None => Err(self.make_rekey_read_error(md, gen, user)),
                Some(params) => {
                    let client_half = self
                        .crypto
                        .decrypt_client_half(&params.ephemeral, &params.encrypted_client_half)
                        .await?;
                    Ok((client_half, params.server_half_id, device))
                }
            }
        }
    }

    /// Fetches the server half and recombines it with the client half.
    ///
    /// A fetch failure is fatal for this call; the caller must retry.
    async fn unmask_with_server_half(
        &self,
        half_id: ServerHalfId,
        device: DevicePublicKey,
        client_half: ClientHalf,
    ) -> Result<FolderKey, KeyError> {
        let server_half = self.key_halves.server_half(half_id, device).await?;
        Ok(unmask(&server_half, &client_half))
    }
}
