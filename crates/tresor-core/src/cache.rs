//! In-memory cache of resolved folder keys.
//!
//! Entries are keyed by the `(folder, generation)` pair; a key is only ever
//! returned for an exact pair match. The cache is a bounded LRU behind a
//! read/write lock, plus a per-entry fill barrier so that two concurrent
//! resolvers for the same pair don't both drive the server-half fetch.
//!
//! Cloning shares the underlying cache; each config owns one instance.

use std::{collections::HashMap, num::NonZeroUsize, sync::Arc};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tresor_crypto::FolderKey;

use crate::{
    error::KeyError,
    id::{FolderId, KeyGen},
};

const DEFAULT_CAPACITY: usize = 5000;

type CacheKey = (FolderId, KeyGen);

struct CacheInner {
    map: RwLock<LruCache<CacheKey, FolderKey>>,
    inflight: Mutex<HashMap<CacheKey, Arc<AsyncMutex<()>>>>,
}

/// Bounded cache of `(folder, generation) → folder key`.
#[derive(Clone)]
pub struct KeyCache {
    inner: Arc<CacheInner>,
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl KeyCache {
    /// Creates a cache holding at most `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN));
        Self {
            inner: Arc::new(CacheInner {
                map: RwLock::new(LruCache::new(capacity)),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Looks up the key for a `(folder, generation)` pair.
    ///
    /// # Errors
    ///
    /// Returns the [`KeyError::KeyCacheMiss`] sentinel when absent.
    pub fn get(&self, folder: FolderId, generation: KeyGen) -> Result<FolderKey, KeyError> {
        let mut map = self.inner.map.write();
        map.get(&(folder, generation))
            .cloned()
            .ok_or(KeyError::KeyCacheMiss { folder, generation })
    }

    /// Stores the key for a `(folder, generation)` pair.
    pub fn put(&self, folder: FolderId, generation: KeyGen, key: FolderKey) {
        self.inner.map.write().put((folder, generation), key);
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.inner.map.read().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquires the fill barrier for one pair.
    ///
    /// At most one holder exists per pair; a second caller waits until the
    /// first drops its permit, then should re-probe the cache before doing
    /// any fetch work of its own.
    pub async fn lock_fill(&self, folder: FolderId, generation: KeyGen) -> FillPermit {
        let slot = {
            let mut inflight = self.inner.inflight.lock();
            inflight
                .entry((folder, generation))
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = slot.lock_owned().await;
        FillPermit { inner: self.inner.clone(), key: (folder, generation), _guard: guard }
    }
}

/// Exclusive permission to fill one cache entry. Releasing it (by drop)
/// wakes the next waiter, if any.
pub struct FillPermit {
    inner: Arc<CacheInner>,
    key: CacheKey,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for FillPermit {
    fn drop(&mut self) {
        let mut inflight = self.inner.inflight.lock();
        // The guard is still alive here, so a count of two means the map
        // holds the only other reference and no one is waiting.
        if let Some(slot) = inflight.get(&self.key) {
            if Arc::strong_count(slot) <= 2 {
                inflight.remove(&self.key);
            }
        }
    }
}
