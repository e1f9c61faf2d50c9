//! The key manager: folder key resolution and the rekey state machine.
//!
//! One [`KeyManager`] serves one configuration: the caller device's crypto
//! facade, the external services, and a private key cache. Filesystem read
//! and write paths call the resolver entry points; background or
//! user-triggered rekeys call [`KeyManager::rekey`], which itself uses the
//! resolver to fetch current keys before producing a new generation.
//!
//! Every call is one logical task. All blocking I/O happens inside the
//! service futures; cancellation is cooperative - dropping the returned
//! future abandons the call at its current suspension point, leaving the
//! in-memory metadata for the caller to discard.

mod resolve;
mod rekey;

use std::ops::{BitOr, BitOrAssign};

use tresor_crypto::{Crypto, FolderKey};

use crate::{
    cache::KeyCache,
    error::KeyError,
    id::{KeyGen, UserInfo},
    metadata::KeyMetadata,
    services::{IdentityService, KeyHalfStore, MetadataOps},
};

/// Lookup behavior flags for key resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyLookupFlags(u8);

impl KeyLookupFlags {
    /// No special behavior: current device, no caching.
    pub const NONE: KeyLookupFlags = KeyLookupFlags(0);

    /// Try every device of the calling user, not just the current one.
    pub const ANY_DEVICE: KeyLookupFlags = KeyLookupFlags(1);

    /// Insert the resolved key into the cache on success.
    pub const DO_CACHE: KeyLookupFlags = KeyLookupFlags(1 << 1);

    /// Allow prompting for a paper-key-derived device key.
    pub const PROMPT_PAPER: KeyLookupFlags = KeyLookupFlags(1 << 2);

    /// Whether all of `other`'s flags are set.
    pub fn contains(self, other: KeyLookupFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for KeyLookupFlags {
    type Output = KeyLookupFlags;

    fn bitor(self, rhs: KeyLookupFlags) -> KeyLookupFlags {
        KeyLookupFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for KeyLookupFlags {
    fn bitor_assign(&mut self, rhs: KeyLookupFlags) {
        self.0 |= rhs.0;
    }
}

/// What a completed rekey did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RekeyOutcome {
    /// Whether the in-memory metadata was modified and should be pushed.
    pub md_changed: bool,
    /// The fresh folder key, when a new generation was added.
    pub new_key: Option<FolderKey>,
}

impl RekeyOutcome {
    pub(crate) fn unchanged() -> Self {
        Self { md_changed: false, new_key: None }
    }
}

/// Resolves folder keys and keeps folder metadata rekeyed.
///
/// Generic over the crypto facade and the three external services; clones
/// of the services share their backing state, while the cache belongs to
/// this manager alone.
pub struct KeyManager<C, I, K, M> {
    pub(crate) crypto: C,
    pub(crate) identity: I,
    pub(crate) key_halves: K,
    pub(crate) md_ops: M,
    pub(crate) cache: KeyCache,
}

impl<C, I, K, M> KeyManager<C, I, K, M>
where
    C: Crypto,
    I: IdentityService,
    K: KeyHalfStore,
    M: MetadataOps,
{
    /// Creates a manager with a default-capacity cache.
    pub fn new(crypto: C, identity: I, key_halves: K, md_ops: M) -> Self {
        Self::with_cache(crypto, identity, key_halves, md_ops, KeyCache::default())
    }

    /// Creates a manager with an explicit cache.
    pub fn with_cache(crypto: C, identity: I, key_halves: K, md_ops: M, cache: KeyCache) -> Self {
        Self { crypto, identity, key_halves, md_ops, cache }
    }

    /// The manager's key cache.
    pub fn cache(&self) -> &KeyCache {
        &self.cache
    }

    /// Builds the error for "the caller has no usable wrapping here": a
    /// rekey request, so the UI can ask another device to rekey.
    pub(crate) fn make_rekey_read_error<MD: KeyMetadata>(
        &self,
        md: &MD,
        generation: KeyGen,
        user: &UserInfo,
    ) -> KeyError {
        KeyError::RekeyRead {
            folder: md.tlf_id(),
            generation,
            username: user.username.clone(),
        }
    }
}
