//! End-to-end rekey scenarios.
//!
//! Each test drives the key manager through the in-memory services: a
//! shared identity world, one key-halves server, and one metadata server,
//! with a separate manager per calling device (matching one config per
//! device in production).

use tresor_core::{
    services::{MemoryIdentity, MemoryKeyHalfStore, MemoryMetadataOps},
    BlockPointer, ConflictInfo, FolderHandle, FolderId, KeyError, KeyGen, KeyManager, KeyMetadata,
    MetadataVersion, RootMetadata, UntrustedRootMetadata, UserId, Username,
};
use tresor_crypto::{encrypt_private_metadata, DevicePrivateKey, DevicePublicKey, LocalCrypto};

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

    fn add_user(&self, user_seed: u8, name: &str, device_seeds: &[u8]) {
        self.identity.add_user(
            uid(user_seed),
            Username::new(name),
            device_seeds.iter().map(|d| device(*d)).collect(),
        );
    }

    /// Logs in as the given user and device and returns that device's
    /// manager.
    fn acting(&self, user_seed: u8, device_seed: u8) -> Manager {
        self.identity.log_in(uid(user_seed), device(device_seed));
        KeyManager::new(
            LocalCrypto::new(device_key(device_seed)),
            self.identity.clone(),
            self.halves.clone(),
            self.md_ops.clone(),
        )
    }
}

fn handle_of(writers: &[(u8, &str)], readers: &[(u8, &str)]) -> FolderHandle {
    FolderHandle::new(
        writers.iter().map(|(n, name)| (uid(*n), Username::new(*name))).collect(),
        readers.iter().map(|(n, name)| (uid(*n), Username::new(*name))).collect(),
    )
}

fn block_at(gen: KeyGen) -> BlockPointer {
    BlockPointer { id: [0; 16], key_gen: gen }
}

/// S1: the first rekey, performed by a writer, creates generation one and
/// every member device resolves the same key.
#[tokio::test]
async fn first_rekey_by_writer() {
    let world = World::new();
    world.add_user(1, "alice", &[11]);
    world.add_user(2, "bob", &[21]);
    let folder = FolderId::new_private([1; 16]);
    let handle = handle_of(&[(1, "alice")], &[(2, "bob")]);
    world.md_ops.set_handle(folder, handle.clone());
    let mut md = RootMetadata::new(MetadataVersion::V3, folder, handle);

    let alice = world.acting(1, 11);
    let outcome = alice.rekey(&mut md, false).await.unwrap();

    assert!(outcome.md_changed);
    let key1 = outcome.new_key.expect("first rekey creates a generation");
    assert_eq!(md.latest_generation(), KeyGen(1));
    assert!(md.is_finalized());

    // Both devices resolve the same folder key.
    assert_eq!(alice.get_folder_key_for_encryption(&md).await.unwrap(), key1);

    let bob = world.acting(2, 21);
    let resolved = bob
        .get_folder_key_for_block_decryption(&md, &block_at(KeyGen(1)))
        .await
        .unwrap();
    assert_eq!(resolved, key1);

    // The caching resolve populated bob's cache.
    assert!(bob.cache().get(folder, KeyGen(1)).is_ok());
    // One server half per device.
    assert_eq!(world.halves.half_count(), 2);
}

/// S2: adding a reader device re-wraps the unchanged generation; no bump,
/// exactly one new server half.
#[tokio::test]
async fn add_reader_device_rewraps_without_bump() {
    let world = World::new();
    world.add_user(1, "alice", &[11]);
    world.add_user(2, "bob", &[21]);
    let folder = FolderId::new_private([1; 16]);
    let handle = handle_of(&[(1, "alice")], &[(2, "bob")]);
    world.md_ops.set_handle(folder, handle.clone());
    let mut md = RootMetadata::new(MetadataVersion::V3, folder, handle);

    let alice = world.acting(1, 11);
    let key1 = alice.rekey(&mut md, false).await.unwrap().new_key.unwrap();
    let halves_before = world.halves.half_count();

    world.identity.add_device(uid(2), device(22));
    let alice = world.acting(1, 11);
    let outcome = alice.rekey(&mut md, false).await.unwrap();

    assert!(outcome.md_changed);
    assert!(outcome.new_key.is_none(), "no generation bump for an added device");
    assert_eq!(md.latest_generation(), KeyGen(1));
    assert_eq!(world.halves.half_count(), halves_before + 1);

    // The new device resolves the original key.
    let bob = world.acting(2, 22);
    let resolved = bob
        .get_folder_key_for_block_decryption(&md, &block_at(KeyGen(1)))
        .await
        .unwrap();
    assert_eq!(resolved, key1);
}

/// S3: revoking a writer device bumps the generation; the revoked device
/// loses access to the new key, everyone else gains it, and the old key
/// stays reachable through the historic chain.
#[tokio::test]
async fn revoke_writer_device_bumps_generation() {
    let world = World::new();
    world.add_user(1, "alice", &[11, 12]);
    world.add_user(2, "bob", &[21, 22]);
    let folder = FolderId::new_private([1; 16]);
    let handle = handle_of(&[(1, "alice")], &[(2, "bob")]);
    world.md_ops.set_handle(folder, handle.clone());
    let mut md = RootMetadata::new(MetadataVersion::V3, folder, handle);

    let alice = world.acting(1, 11);
    let key1 = alice.rekey(&mut md, false).await.unwrap().new_key.unwrap();

    world.identity.revoke_device(uid(1), &device(11));
    let alice2 = world.acting(1, 12);
    let outcome = alice2.rekey(&mut md, false).await.unwrap();

    let key2 = outcome.new_key.expect("revocation bumps the generation");
    assert_eq!(md.latest_generation(), KeyGen(2));
    assert_ne!(key2, key1);

    // The revoked device's server half was deleted.
    let deleted = world.halves.deleted();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].0, uid(1));
    assert_eq!(deleted[0].1, device(11).kid());

    // Remaining devices all resolve the new key.
    for (user, dev) in [(1, 12), (2, 21), (2, 22)] {
        let manager = world.acting(user, dev);
        let resolved = manager
            .get_folder_key_for_block_decryption(&md, &block_at(KeyGen(2)))
            .await
            .unwrap();
        assert_eq!(resolved, key2);
    }

    // The revoked device cannot unwrap the new generation.
    let revoked = world.acting(1, 11);
    let err = revoked
        .get_folder_key_for_block_decryption(&md, &block_at(KeyGen(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, KeyError::RekeyRead { .. }), "got {err:?}");

    // The historic chain recovers generation one from the new key.
    let bob = world.acting(2, 21);
    let recovered = bob
        .get_folder_key_for_block_decryption(&md, &block_at(KeyGen(1)))
        .await
        .unwrap();
    assert_eq!(recovered, key1);
}

/// S4: a reader promoted to writer moves bundles without counting as a
/// revocation for themselves, but still bumps the generation (the known
/// over-eager behavior for promotion-only changes).
#[tokio::test]
async fn reader_promotion_moves_bundles_and_bumps_once() {
    let world = World::new();
    world.add_user(1, "alice", &[11]);
    world.add_user(2, "bob", &[21]);
    let folder = FolderId::new_private([1; 16]);
    let mut handle = handle_of(&[(1, "alice")], &[(2, "bob")]);
    handle.add_unresolved_writer("bob@site");
    world.md_ops.set_handle(folder, handle.clone());
    let mut md = RootMetadata::new(MetadataVersion::V2, folder, handle);

    let alice = world.acting(1, 11);
    alice.rekey(&mut md, false).await.unwrap();
    assert_eq!(md.latest_generation(), KeyGen(1));

    // bob's writer assertion now resolves: reader -> writer.
    world.identity.bind_assertion("bob@site", uid(2));
    let alice = world.acting(1, 11);
    let outcome = alice.rekey(&mut md, false).await.unwrap();

    // Exactly one generation bump.
    let key2 = outcome.new_key.expect("promotion-only change still bumps the generation");
    assert_eq!(md.latest_generation(), KeyGen(2));

    // bob's reader entries are gone; he is in the writer bundles at every
    // generation (V2 keeps them all per-device).
    for gen in [KeyGen(1), KeyGen(2)] {
        let (readers, writers) = md.get_user_device_key_info_maps(gen).unwrap();
        assert!(!readers.contains_key(&uid(2)), "reader entry at {gen} should be gone");
        assert!(writers.contains_key(&uid(2)), "writer entry at {gen} should exist");
    }

    // bob still resolves both generations.
    let bob = world.acting(2, 21);
    bob.get_folder_key_for_block_decryption(&md, &block_at(KeyGen(1))).await.unwrap();
    let resolved = bob
        .get_folder_key_for_block_decryption(&md, &block_at(KeyGen(2)))
        .await
        .unwrap();
    assert_eq!(resolved, key2);

    // The promoted user lost no server halves.
    assert!(world.halves.deleted().is_empty());
}

/// S5a: a reader enrolling their own new device succeeds alone when
/// nothing else is pending, touching only their own reader entry.
#[tokio::test]
async fn reader_self_enrollment_succeeds_alone() {
    let world = World::new();
    world.add_user(1, "alice", &[11]);
    world.add_user(3, "charlie", &[31]);
    let folder = FolderId::new_private([1; 16]);
    let handle = handle_of(&[(1, "alice")], &[(3, "charlie")]);
    world.md_ops.set_handle(folder, handle.clone());
    let mut md = RootMetadata::new(MetadataVersion::V3, folder, handle);

    let alice = world.acting(1, 11);
    let key1 = alice.rekey(&mut md, false).await.unwrap().new_key.unwrap();

    let (_, writers_before) = md.get_user_device_key_info_maps(KeyGen(1)).unwrap();

    // The enrollment runs from charlie's existing device; the new device
    // has no wrapping yet and could not unwrap anything itself.
    world.identity.add_device(uid(3), device(32));
    let charlie = world.acting(3, 31);
    let outcome = charlie.rekey(&mut md, false).await.unwrap();

    assert!(outcome.md_changed);
    assert!(outcome.new_key.is_none());
    assert_eq!(md.latest_generation(), KeyGen(1));

    // Writer bundle untouched.
    let (readers_after, writers_after) = md.get_user_device_key_info_maps(KeyGen(1)).unwrap();
    assert_eq!(writers_before, writers_after);
    assert!(readers_after[&uid(3)].contains_key(&device(32)));

    // The new device can now resolve the key it was enrolled for.
    let fresh = world.acting(3, 32);
    let resolved = fresh
        .get_folder_key_for_block_decryption(&md, &block_at(KeyGen(1)))
        .await
        .unwrap();
    assert_eq!(resolved, key1);
}

/// S5b: the same self-enrollment returns `RekeyIncomplete` when writer
/// work is also pending - with the reader's own progress preserved.
#[tokio::test]
async fn reader_self_enrollment_reports_incomplete_when_writers_pending() {
    let world = World::new();
    world.add_user(1, "alice", &[11]);
    world.add_user(3, "charlie", &[31]);
    let folder = FolderId::new_private([1; 16]);
    let handle = handle_of(&[(1, "alice")], &[(3, "charlie")]);
    world.md_ops.set_handle(folder, handle.clone());
    let mut md = RootMetadata::new(MetadataVersion::V3, folder, handle);

    let alice = world.acting(1, 11);
    alice.rekey(&mut md, false).await.unwrap();

    // Both charlie and alice grow a device; charlie can only enroll
    // himself, driving the rekey from his existing device.
    world.identity.add_device(uid(3), device(32));
    world.identity.add_device(uid(1), device(12));

    let charlie = world.acting(3, 31);
    let err = charlie.rekey(&mut md, false).await.unwrap_err();
    match err {
        KeyError::RekeyIncomplete { md_changed } => assert!(md_changed),
        other => panic!("expected RekeyIncomplete, got {other:?}"),
    }

    // Charlie's own entry landed; alice's new device is still missing.
    let (readers, writers) = md.get_user_device_key_info_maps(KeyGen(1)).unwrap();
    assert!(readers[&uid(3)].contains_key(&device(32)));
    assert!(!writers[&uid(1)].contains_key(&device(12)));
}

/// S6: a public folder rekey with a changed canonical name rewrites the
/// handle and touches no key material.
#[tokio::test]
async fn public_handle_only_rename() {
    let world = World::new();
    world.add_user(1, "alice", &[11]);
    let folder = FolderId::new_public([1; 16]);
    let handle = handle_of(&[(1, "alice")], &[]);
    world.md_ops.set_handle(folder, handle.clone());
    let mut md = RootMetadata::new(MetadataVersion::V3, folder, handle);

    world.identity.rename_user(uid(1), Username::new("alice.renamed"));
    let alice = world.acting(1, 11);
    let outcome = alice.rekey(&mut md, false).await.unwrap();

    assert!(outcome.md_changed);
    assert!(outcome.new_key.is_none());
    assert_eq!(md.handle().canonical_name(), "alice.renamed");
    assert_eq!(md.latest_generation(), KeyGen::PUBLIC);
    assert_eq!(world.halves.half_count(), 0);

    // Unchanged handle: no-op.
    let outcome = alice.rekey(&mut md, false).await.unwrap();
    assert!(!outcome.md_changed);
}

/// A handle-only change on a private folder updates the handle without
/// touching key material, and merges any server-side conflict marker.
#[tokio::test]
async fn private_rename_merges_server_conflict_marker() {
    let world = World::new();
    world.add_user(1, "alice", &[11]);
    let folder = FolderId::new_private([1; 16]);
    let handle = handle_of(&[(1, "alice")], &[]);
    // The server has since marked the folder conflicted.
    let mut server_handle = handle.clone();
    server_handle.set_conflict_info(Some(ConflictInfo { date: 1_700_000_000, number: 1 }));
    world.md_ops.set_handle(folder, server_handle);
    let mut md = RootMetadata::new(MetadataVersion::V3, folder, handle);

    let alice = world.acting(1, 11);
    let key1 = alice.rekey(&mut md, false).await.unwrap().new_key.unwrap();

    world.identity.rename_user(uid(1), Username::new("alice.renamed"));
    let outcome = alice.rekey(&mut md, false).await.unwrap();

    assert!(outcome.md_changed);
    assert!(outcome.new_key.is_none());
    assert_eq!(md.latest_generation(), KeyGen(1));
    assert_eq!(md.handle().canonical_name(), "alice.renamed");
    assert!(md.handle().conflict_info().is_some());

    // Key material is untouched.
    assert_eq!(alice.get_folder_key_for_encryption(&md).await.unwrap(), key1);
}

/// Rekeying with nothing changed is a no-op for private folders too.
#[tokio::test]
async fn unchanged_membership_is_a_noop() {
    let world = World::new();
    world.add_user(1, "alice", &[11]);
    world.add_user(2, "bob", &[21]);
    let folder = FolderId::new_private([1; 16]);
    let handle = handle_of(&[(1, "alice")], &[(2, "bob")]);
    world.md_ops.set_handle(folder, handle.clone());
    let mut md = RootMetadata::new(MetadataVersion::V3, folder, handle);

    let alice = world.acting(1, 11);
    alice.rekey(&mut md, false).await.unwrap();

    let outcome = alice.rekey(&mut md, false).await.unwrap();
    assert!(!outcome.md_changed);
    assert!(outcome.new_key.is_none());
    assert_eq!(md.latest_generation(), KeyGen(1));
}

/// A reader may not create the first key generation.
#[tokio::test]
async fn reader_cannot_create_first_generation() {
    let world = World::new();
    world.add_user(1, "alice", &[11]);
    world.add_user(2, "bob", &[21]);
    let folder = FolderId::new_private([1; 16]);
    let handle = handle_of(&[(1, "alice")], &[(2, "bob")]);
    world.md_ops.set_handle(folder, handle.clone());
    let mut md = RootMetadata::new(MetadataVersion::V3, folder, handle);

    let bob = world.acting(2, 21);
    let err = bob.rekey(&mut md, false).await.unwrap_err();
    assert!(matches!(err, KeyError::ReadAccess { .. }), "got {err:?}");
    assert_eq!(md.latest_generation(), KeyGen::UNSET);
}

/// Pins the current behavior for a reader whose own device was revoked:
/// the revocation forces a generation bump, which a reader cannot drive,
/// so the call reports `RekeyIncomplete` with nothing changed.
#[tokio::test]
async fn reader_with_revoked_device_gets_incomplete() {
    let world = World::new();
    world.add_user(1, "alice", &[11]);
    world.add_user(2, "bob", &[21, 22]);
    let folder = FolderId::new_private([1; 16]);
    let handle = handle_of(&[(1, "alice")], &[(2, "bob")]);
    world.md_ops.set_handle(folder, handle.clone());
    let mut md = RootMetadata::new(MetadataVersion::V3, folder, handle);

    let alice = world.acting(1, 11);
    alice.rekey(&mut md, false).await.unwrap();

    world.identity.revoke_device(uid(2), &device(22));
    let bob = world.acting(2, 21);
    let err = bob.rekey(&mut md, false).await.unwrap_err();
    match err {
        KeyError::RekeyIncomplete { md_changed } => assert!(!md_changed),
        other => panic!("expected RekeyIncomplete, got {other:?}"),
    }

    // The revoked wrapping is still in place; pruning waits for a writer.
    let (readers, _) = md.get_user_device_key_info_maps(KeyGen(1)).unwrap();
    assert!(readers[&uid(2)].contains_key(&device(22)));
    assert_eq!(md.latest_generation(), KeyGen(1));
}

/// Stale serialized private metadata is decrypted with the outgoing key
/// before a generation bump, so no ciphertext is orphaned.
#[tokio::test]
async fn stale_private_metadata_is_decrypted_before_bump() {
    let world = World::new();
    world.add_user(1, "alice", &[11, 12]);
    let folder = FolderId::new_private([1; 16]);
    let handle = handle_of(&[(1, "alice")], &[]);
    world.md_ops.set_handle(folder, handle.clone());
    let mut md = RootMetadata::new(MetadataVersion::V3, folder, handle);

    let alice = world.acting(1, 11);
    let key1 = alice.rekey(&mut md, false).await.unwrap().new_key.unwrap();

    md.set_serialized_private_metadata(encrypt_private_metadata(&key1, b"root block", [7; 8]));
    assert!(!md.is_readable());

    world.identity.revoke_device(uid(1), &device(11));
    let alice2 = world.acting(1, 12);
    alice2.rekey(&mut md, false).await.unwrap();

    assert_eq!(md.latest_generation(), KeyGen(2));
    assert!(md.is_readable());
    assert_eq!(md.private_data(), Some(b"root block".as_slice()));
}

/// Metadata from an untrusted source refuses local mutation.
#[tokio::test]
async fn untrusted_metadata_cannot_be_rekeyed() {
    let world = World::new();
    world.add_user(1, "alice", &[11]);
    world.add_user(2, "bob", &[21]);
    let folder = FolderId::new_private([1; 16]);
    let handle = handle_of(&[(1, "alice")], &[(2, "bob")]);
    world.md_ops.set_handle(folder, handle.clone());
    let mut md = RootMetadata::new(MetadataVersion::V3, folder, handle);

    let alice = world.acting(1, 11);
    alice.rekey(&mut md, false).await.unwrap();

    // A device change forces the engine to mutate - which untrusted
    // metadata refuses.
    world.identity.add_device(uid(2), device(22));
    let mut untrusted = UntrustedRootMetadata::new(md);
    let err = alice.rekey(&mut untrusted, false).await.unwrap_err();
    assert!(matches!(err, KeyError::MutableMetadataNotImpl), "got {err:?}");
}

/// A paper-key prompt against a public folder is rejected outright.
#[tokio::test]
async fn paper_prompt_for_public_folder_is_invalid() {
    let world = World::new();
    world.add_user(1, "alice", &[11]);
    let folder = FolderId::new_public([1; 16]);
    let handle = handle_of(&[(1, "alice")], &[]);
    world.md_ops.set_handle(folder, handle.clone());
    let mut md = RootMetadata::new(MetadataVersion::V3, folder, handle);

    let alice = world.acting(1, 11);
    let err = alice.rekey(&mut md, true).await.unwrap_err();
    assert!(matches!(err, KeyError::PaperPromptForPublic { .. }), "got {err:?}");
}

/// A device provisioned only through a paper key can drive a rekey when
/// prompting is allowed. The paper device (19) is enrolled like any other
/// device; what gates its use is that the prompt flag must be set before
/// its private key is consulted.
#[tokio::test]
async fn paper_key_rekey_requires_prompt() {
    let world = World::new();
    world.add_user(1, "alice", &[11, 19]);
    world.add_user(2, "bob", &[21]);
    let folder = FolderId::new_private([1; 16]);
    let handle = handle_of(&[(1, "alice")], &[(2, "bob")]);
    world.md_ops.set_handle(folder, handle.clone());
    let mut md = RootMetadata::new(MetadataVersion::V3, folder, handle);

    let alice = world.acting(1, 11);
    alice.rekey(&mut md, false).await.unwrap();

    // Alice's laptop is revoked and replaced. The fresh device has no
    // wrapping at generation one; only the paper key can unwrap it.
    world.identity.revoke_device(uid(1), &device(11));
    world.identity.add_device(uid(1), device(12));
    world.identity.log_in(uid(1), device(12));
    let fresh = KeyManager::new(
        LocalCrypto::with_paper_keys(device_key(12), vec![device_key(19)]),
        world.identity.clone(),
        world.halves.clone(),
        world.md_ops.clone(),
    );

    // Without prompting, the paper wrapping stays out of reach.
    let err = fresh.rekey(&mut md, false).await.unwrap_err();
    assert!(matches!(err, KeyError::RekeyRead { .. }), "got {err:?}");

    let outcome = fresh.rekey(&mut md, true).await.unwrap();
    assert_eq!(md.latest_generation(), KeyGen(2));
    let key2 = outcome.new_key.unwrap();
    let resolved = fresh
        .get_folder_key_for_block_decryption(&md, &block_at(KeyGen(2)))
        .await
        .unwrap();
    assert_eq!(resolved, key2);
}
