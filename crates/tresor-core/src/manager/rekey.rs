//! The rekey state machine.
//!
//! Diffs the device sets the identity service currently reports against
//! the sets recorded in the latest key bundle, then decides among
//! re-wrapping for added devices, bumping the generation for removals,
//! promoting readers, updating only the handle, or doing nothing.
//!
//! Ordering within one call: existing generations are re-wrapped from the
//! first valid generation upward, server halves for revoked devices are
//! deleted before the new generation is appended (latest-only metadata
//! drops the removal info at the append), and on every exit that changed
//! the metadata the latest bundle is sealed before the re-resolved handle
//! is stored.

use std::collections::BTreeSet;

use tresor_crypto::{Crypto, FolderKey};

use crate::{
    codec,
    error::KeyError,
    id::{KeyGen, UserId},
    keybundle::{users_with_new_devices, users_with_removed_devices, UserDevicePublicKeys},
    manager::{KeyLookupFlags, KeyManager, RekeyOutcome},
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
    /// Brings the folder's wrappings in line with current membership.
    ///
    /// Returns what changed: `(true, Some(key))` when a new generation was
    /// added, `(true, None)` when only re-wrapping, promotion, or a handle
    /// update occurred, `(false, None)` for a no-op.
    ///
    /// # Errors
    ///
    /// - `RekeyIncomplete`: the caller is a reader and did what it could;
    ///   `md_changed` still reports truthfully whether the metadata should
    ///   be pushed
    /// - `ReadAccess`: a reader tried to create the first generation
    /// - Any error after the generation was appended leaves the in-memory
    ///   metadata in the new-generation state; the caller must not push it
    pub async fn rekey<MD: KeyMetadata>(
        &self,
        md: &mut MD,
        prompt_paper: bool,
    ) -> Result<RekeyOutcome, KeyError> {
        let folder = md.tlf_id();
        tracing::debug!(%folder, prompt_paper, "rekey start");

        let curr_gen = md.latest_generation();
        if folder.is_public() != (curr_gen == KeyGen::PUBLIC) {
            return Err(KeyError::MetadataInconsistent {
                folder,
                reason: format!(
                    "is_public={} but latest generation is {curr_gen}",
                    folder.is_public()
                ),
            });
        }
        if prompt_paper && folder.is_public() {
            return Err(KeyError::PaperPromptForPublic { folder });
        }

        let handle = md.handle().clone();
        let user = self.identity.current_user().await?;

        let mut resolved = handle.resolve_again(&self.identity).await?;
        let is_writer = resolved.is_writer(user.uid);
        if !folder.is_public() && !is_writer {
            if handle.is_reader(user.uid) {
                // Already a reader before resolution: keep the original
                // handle rather than a self-restricted resolution.
                tracing::debug!(%folder, "non-writer reader; reverting to original handle");
                resolved = handle.clone();
            } else {
                // Only allow the caller's own entry to change.
                resolved = handle.resolve_again_for_user(&self.identity, user.uid).await?;
            }
        }

        let handle_changed = !codec::equal(&handle, &resolved)?;
        if handle_changed {
            tracing::debug!(
                %folder,
                from = %handle.canonical_name(),
                to = %resolved.canonical_name(),
                "handle resolved to a new form"
            );
            // The server may have marked the folder conflicted in the
            // meantime; carry that marker along.
            let latest_handle = self.md_ops.latest_handle(folder).await?;
            if let Some(conflict) = latest_handle.conflict_info() {
                tracing::debug!(%folder, "handle is conflicted");
                resolved.set_conflict_info(Some(conflict.clone()));
            }
        }

        // Public folders carry no key material; only the handle can change.
        if folder.is_public() {
            if !handle_changed {
                tracing::debug!(%folder, "skipping rekey (public): handle unchanged");
                return Ok(RekeyOutcome::unchanged());
            }
            md.update_from_tlf_handle(&resolved)?;
            return Ok(RekeyOutcome { md_changed: true, new_key: None });
        }

        let mut inc_key_gen = curr_gen < KeyGen::FIRST_VALID;
        if !is_writer && inc_key_gen {
            // Readers cannot create the first key generation.
            return Err(KeyError::ReadAccess { folder, username: user.username.clone() });
        }

        let mut w_keys = self.device_keys_for_users(resolved.writer_ids()).await?;
        let mut r_keys = self.device_keys_for_users(resolved.reader_ids()).await?;

        let mut add_new_reader_device = false;
        let mut add_new_writer_device = false;
        let mut add_self_reader_device = false;
        let mut new_reader_users = BTreeSet::new();
        let mut new_writer_users = BTreeSet::new();
        let mut promoted_readers: BTreeSet<UserId> = BTreeSet::new();

        // When the generation is already being bumped (first rekey ever),
        // the key delta doesn't matter.
        if !inc_key_gen {
            let (r_dkim, w_dkim) = md.get_user_device_key_info_maps(curr_gen)?;

            new_writer_users = users_with_new_devices(&folder, &w_dkim, &w_keys);
            new_reader_users = users_with_new_devices(&folder, &r_dkim, &r_keys);
            add_new_writer_device = !new_writer_users.is_empty();
            add_new_reader_device = !new_reader_users.is_empty();

            let w_removed = users_with_removed_devices(&folder, &w_dkim, &w_keys);
            let r_removed = users_with_removed_devices(&folder, &r_dkim, &r_keys);
            // TODO: this is incorrectly true when the only change is a
            // reader promotion.
            inc_key_gen = !w_removed.is_empty() || !r_removed.is_empty();

            // Captured before the removal merge below grows the set.
            add_self_reader_device = new_reader_users.contains(&user.uid);

            for removed in &r_removed {
                // A removed reader still needs re-wrapping at the new
                // generation for their remaining devices. Note: this may
                // let a reader attempt a rekey when their own device was
                // revoked; inc_key_gen above should stop it downstream.
                new_reader_users.insert(*removed);
                // Removed as reader and gaining writer keys: a promotion,
                // not a revocation. Must be tracked before the writer
                // merge below.
                if new_writer_users.contains(removed) {
                    promoted_readers.insert(*removed);
                }
            }
            for removed in &w_removed {
                new_writer_users.insert(*removed);
            }

            let to_identify: Vec<UserId> =
                new_writer_users.union(&new_reader_users).copied().collect();
            if !to_identify.is_empty() {
                self.identity.identify_users(&to_identify).await?;
            }
        }

        if !add_new_reader_device && !add_new_writer_device && !inc_key_gen && !handle_changed {
            tracing::debug!(
                %folder,
                "skipping rekey (private): no device changes, no new generation, handle unchanged"
            );
            return Ok(RekeyOutcome::unchanged());
        }

        if !is_writer {
            if new_reader_users.contains(&user.uid) && !promoted_readers.contains(&user.uid) {
                // A reader may enroll their own new device without writer
                // intervention; restrict the rekey scope to just them.
                let own = r_keys.remove(&user.uid).unwrap_or_default();
                r_keys = UserDevicePublicKeys::from([(user.uid, own)]);
                w_keys = UserDevicePublicKeys::new();
                new_reader_users.remove(&user.uid);
            } else {
                // Nothing a reader is allowed to do here.
                return Err(KeyError::RekeyIncomplete { md_changed: false });
            }
        }

        // One ephemeral pair serves every wrapping this pass creates; the
        // private half is discarded on return.
        let (ephemeral_public, ephemeral_private) = self.crypto.random_ephemeral_keypair();

        for promoted in &promoted_readers {
            md.promote_reader(*promoted)?;
        }

        let mut any_device_flags = KeyLookupFlags::ANY_DEVICE;
        if prompt_paper {
            any_device_flags |= KeyLookupFlags::PROMPT_PAPER;
        }

        // Add new devices to every existing generation. Latest-only
        // metadata answers NotPerDeviceEncrypted for historic generations;
        // those are covered implicitly by the chain once the latest is
        // updated.
        if add_new_reader_device || add_new_writer_device {
            let mut gen = KeyGen::FIRST_VALID;
            while gen <= curr_gen {
                let gen_key = self.get_folder_key(&*md, gen, any_device_flags).await?;
                match md.update_key_generation(
                    &self.crypto,
                    gen,
                    &w_keys,
                    &r_keys,
                    &ephemeral_public,
                    &ephemeral_private,
                    &gen_key,
                ) {
                    Err(KeyError::NotPerDeviceEncrypted { .. }) => {}
                    Err(err) => return Err(err),
                    Ok(halves) => self.key_halves.put_server_halves(halves).await?,
                }
                gen = gen.next();
            }
        }

        // The serialized private metadata is always encrypted under the
        // latest key; decrypt it now, or the generation bump below would
        // orphan the ciphertext.
        if !md.is_readable() {
            let latest_key = self
                .get_folder_key(
                    &*md,
                    curr_gen,
                    KeyLookupFlags::ANY_DEVICE | KeyLookupFlags::DO_CACHE,
                )
                .await?;
            md.decrypt_private_metadata(&latest_key)?;
        }

        let tail: Result<(bool, Option<FolderKey>), KeyError> = async {
            if !is_writer {
                if !new_reader_users.is_empty() || add_new_writer_device || inc_key_gen {
                    // The caller did what a reader may do; someone else
                    // must finish.
                    return Err(KeyError::RekeyIncomplete { md_changed: add_self_reader_device });
                }
                return Ok((true, None));
            }
            if !inc_key_gen {
                return Ok((true, None));
            }

            // Delete server halves for revoked devices before appending
            // the new generation: latest-only metadata keeps removal info
            // only while the old bundle is intact. A failure between the
            // deletes and the append leaves orphaned IDs server-side,
            // which is accepted.
            if curr_gen >= KeyGen::FIRST_VALID {
                let removal = md.revoke_removed_devices(&w_keys, &r_keys)?;
                for (removed_user, record) in removal {
                    if record.user_removed {
                        tracing::info!(%folder, user = %removed_user, "rekey: removed user");
                    }
                    for (device, half_ids) in record.device_server_half_ids {
                        tracing::info!(
                            %folder,
                            user = %removed_user,
                            device = %device.kid(),
                            halves = half_ids.len(),
                            "rekey: deleting server halves for revoked device"
                        );
                        for half_id in half_ids {
                            self.key_halves
                                .delete_server_half(removed_user, device.kid(), half_id)
                                .await?;
                        }
                    }
                }
            }

            let (tlf_public, tlf_private, new_key) = self.crypto.random_folder_keypair();

            // Chain the outgoing key under the new one.
            let prev_key = if md.stores_historic_keys() && curr_gen >= KeyGen::FIRST_VALID {
                Some(self.get_folder_key(&*md, curr_gen, any_device_flags).await?)
            } else {
                None
            };

            md.add_key_generation(&self.crypto, prev_key.as_ref(), &new_key, tlf_public)?;
            let new_gen = md.latest_generation();
            tracing::info!(%folder, generation = %new_gen, "rekey: added key generation");

            let halves = md.update_key_generation(
                &self.crypto,
                new_gen,
                &w_keys,
                &r_keys,
                &ephemeral_public,
                &ephemeral_private,
                &new_key,
            )?;
            self.key_halves.put_server_halves(halves).await?;
            md.set_tlf_private_key(tlf_private)?;

            Ok((true, Some(new_key)))
        }
        .await;

        // Every exit that changed the metadata seals the latest bundle,
        // then stores the re-resolved handle - including partial reader
        // progress.
        match tail {
            Ok((md_changed, new_key)) => {
                if md_changed {
                    md.finalize_rekey()?;
                }
                md.update_from_tlf_handle(&resolved)?;
                tracing::debug!(%folder, md_changed, bumped = new_key.is_some(), "rekey done");
                Ok(RekeyOutcome { md_changed, new_key })
            }
            Err(KeyError::RekeyIncomplete { md_changed }) => {
                if md_changed {
                    md.finalize_rekey()?;
                }
                md.update_from_tlf_handle(&resolved)?;
                tracing::debug!(%folder, md_changed, "rekey incomplete; another party must finish");
                Err(KeyError::RekeyIncomplete { md_changed })
            }
            Err(err) => Err(err),
        }
    }

    /// Fetches every listed user's current device keys, flushing the
    /// identity service's per-user cache first so revocations and fresh
    /// enrollments are observed.
    async fn device_keys_for_users(
        &self,
        users: Vec<UserId>,
    ) -> Result<UserDevicePublicKeys, KeyError> {
        let mut map = UserDevicePublicKeys::new();
        for user in users {
            self.identity.flush_user_cache(user).await;
            let devices = self.identity.device_keys(user).await?;
            map.insert(user, devices.into_iter().collect());
        }
        Ok(map)
    }
}
