//! Property tests for the rekey engine.
//!
//! These verify the engine's fundamental invariants:
//!
//! 1. **Re-wrap stability**: adding or removing a device without a
//!    generation bump never changes the latest key, so old ciphertext
//!    still decrypts
//! 2. **Revocation soundness**: immediately after a revoking rekey, the
//!    revoked device fails on every generation newer than the pre-rekey
//!    latest
//! 3. **Self-only rekey**: a reader enrolling their own device leaves the
//!    writer bundles byte-for-byte unchanged

use proptest::prelude::*;
use tresor_core::{
    codec,
    services::{MemoryIdentity, MemoryKeyHalfStore, MemoryMetadataOps},
    BlockPointer, FolderHandle, FolderId, KeyError, KeyGen, KeyManager, KeyMetadata,
    MetadataVersion, RootMetadata, UserId, Username,
};
use tresor_crypto::{
    decrypt_private_metadata, encrypt_private_metadata, DevicePrivateKey, DevicePublicKey,
    LocalCrypto,
};

type Manager = KeyManager<LocalCrypto, MemoryIdentity, MemoryKeyHalfStore, MemoryMetadataOps>;

fn uid(n: u8) -> UserId {
    UserId::from_bytes([n; 16])
}

fn device_key(n: u8) -> DevicePrivateKey {
    DevicePrivateKey::from_bytes([n; 32])
}

fn device(n: u8) -> DevicePublicKey {
    device_key(n).public_key()
}

struct World {
    identity: MemoryIdentity,
    halves: MemoryKeyHalfStore,
    md_ops: MemoryMetadataOps,
}

impl World {
    fn new() -> Self {
        Self {
            identity: MemoryIdentity::new(),
            halves: MemoryKeyHalfStore::new(),
            md_ops: MemoryMetadataOps::new(),
        }
    }

    fn acting(&self, user_seed: u8, device_seed: u8) -> Manager {
        self.identity.log_in(uid(user_seed), device(device_seed));
        KeyManager::new(
            LocalCrypto::new(device_key(device_seed)),
            self.identity.clone(),
            self.halves.clone(),
            self.md_ops.clone(),
        )
    }

    /// Standard two-member folder: alice writes, bob reads.
    fn standard_folder(
        &self,
        version: MetadataVersion,
        alice_devices: &[u8],
        bob_devices: &[u8],
    ) -> RootMetadata {
        self.identity.add_user(
            uid(1),
            Username::new("alice"),
            alice_devices.iter().map(|d| device(*d)).collect(),
        );
        self.identity.add_user(
            uid(2),
            Username::new("bob"),
            bob_devices.iter().map(|d| device(*d)).collect(),
        );
        let folder = FolderId::new_private([1; 16]);
        let handle = FolderHandle::new(
            [(uid(1), Username::new("alice"))].into(),
            [(uid(2), Username::new("bob"))].into(),
        );
        self.md_ops.set_handle(folder, handle.clone());
        RootMetadata::new(version, folder, handle)
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime construction cannot fail")
}

fn version_of(v3: bool) -> MetadataVersion {
    if v3 {
        MetadataVersion::V3
    } else {
        MetadataVersion::V2
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Invariant 2: ciphertext sealed under the latest key survives a
    /// non-bumping rekey (device addition).
    #[test]
    fn prop_rewrap_preserves_latest_key(
        plaintext in prop::collection::vec(any::<u8>(), 0..256),
        added_devices in 1u8..=3,
        v3 in any::<bool>(),
    ) {
        let rt = runtime();
        let decrypted = rt.block_on(async {
            let world = World::new();
            let mut md = world.standard_folder(version_of(v3), &[11], &[21]);

            let alice = world.acting(1, 11);
            let key_before = alice.rekey(&mut md, false).await.unwrap().new_key.unwrap();
            let sealed = encrypt_private_metadata(&key_before, &plaintext, [3; 8]);

            for i in 0..added_devices {
                world.identity.add_device(uid(2), device(22 + i));
            }
            let outcome = world.acting(1, 11).rekey(&mut md, false).await.unwrap();
            assert!(outcome.new_key.is_none(), "device addition must not bump");

            // Resolve the latest key again, as one of the new devices.
            let fresh = world.acting(2, 22);
            let key_after = fresh
                .get_folder_key_for_block_decryption(
                    &md,
                    &BlockPointer { id: [0; 16], key_gen: md.latest_generation() },
                )
                .await
                .unwrap();
            decrypt_private_metadata(&key_after, &sealed).unwrap()
        });

        prop_assert_eq!(decrypted, plaintext);
    }

    /// Invariant 4: right after a revoking rekey, the revoked device
    /// fails with a rekey-read error at every generation newer than the
    /// pre-rekey latest.
    #[test]
    fn prop_revocation_locks_out_revoked_device(
        bob_device_count in 2u8..=4,
        revoked_offset in 0u8..=3,
        v3 in any::<bool>(),
    ) {
        let revoked_offset = revoked_offset % bob_device_count;
        let rt = runtime();
        let (revoked_result, survivor_ok) = rt.block_on(async {
            let world = World::new();
            let bob_devices: Vec<u8> = (21..21 + bob_device_count).collect();
            let mut md = world.standard_folder(version_of(v3), &[11], &bob_devices);

            world.acting(1, 11).rekey(&mut md, false).await.unwrap();
            let latest_before = md.latest_generation();

            let revoked = bob_devices[revoked_offset as usize];
            world.identity.revoke_device(uid(2), &device(revoked));
            world.acting(1, 11).rekey(&mut md, false).await.unwrap();
            assert_eq!(md.latest_generation(), latest_before.next());

            let revoked_manager = world.acting(2, revoked);
            let revoked_result = revoked_manager
                .get_folder_key_for_block_decryption(
                    &md,
                    &BlockPointer { id: [0; 16], key_gen: md.latest_generation() },
                )
                .await;

            // Any surviving device still resolves the new generation.
            let survivor = bob_devices.iter().find(|d| **d != revoked).copied();
            let survivor_ok = match survivor {
                Some(d) => world
                    .acting(2, d)
                    .get_folder_key_for_block_decryption(
                        &md,
                        &BlockPointer { id: [0; 16], key_gen: md.latest_generation() },
                    )
                    .await
                    .is_ok(),
                None => true,
            };
            (revoked_result, survivor_ok)
        });

        prop_assert!(
            matches!(revoked_result, Err(KeyError::RekeyRead { .. })),
            "revoked device must get a rekey-read error, got {:?}",
            revoked_result
        );
        prop_assert!(survivor_ok);
    }

    /// Invariant 6: a reader's self-enrollment changes no writer-bundle
    /// bytes.
    #[test]
    fn prop_reader_self_rekey_leaves_writers_untouched(
        new_devices in 1u8..=2,
        v3 in any::<bool>(),
    ) {
        let rt = runtime();
        let (writers_before, writers_after, reader_has_new) = rt.block_on(async {
            let world = World::new();
            let mut md = world.standard_folder(version_of(v3), &[11], &[21]);

            world.acting(1, 11).rekey(&mut md, false).await.unwrap();
            let (_, writers_before) =
                md.get_user_device_key_info_maps(KeyGen(1)).unwrap();

            for i in 0..new_devices {
                world.identity.add_device(uid(2), device(22 + i));
            }
            // The existing device drives the enrollment; new devices have
            // no wrapping to unwrap with yet.
            let bob = world.acting(2, 21);
            bob.rekey(&mut md, false).await.unwrap();

            let (readers_after, writers_after) =
                md.get_user_device_key_info_maps(KeyGen(1)).unwrap();
            let reader_has_new = (0..new_devices)
                .all(|i| readers_after[&uid(2)].contains_key(&device(22 + i)));
            (writers_before, writers_after, reader_has_new)
        });

        prop_assert_eq!(
            codec::encode(&writers_before).unwrap(),
            codec::encode(&writers_after).unwrap(),
            "writer bundles must be byte-identical"
        );
        prop_assert!(reader_has_new, "the reader's new devices must be enrolled");
    }
}
