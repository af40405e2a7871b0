use super::{Digest, Pba};
use crate::os::Mutex;
use crate::prelude::*;

use core::num::NonZeroUsize;
use lru::LruCache;

/// A cache of verified plain node blocks, keyed by physical address.
///
/// Every hit is checked against the digest the caller expects, so a block
/// rewritten in place is never served stale.
pub struct NodeCache {
    cache: Mutex<LruCache<Pba, (Digest, Arc<[u8]>)>>,
    capacity: NonZeroUsize,
}

impl NodeCache {
    /// Creates a cache holding at most `capacity` blocks.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            capacity,
        }
    }

    /// Returns the cached block at `pba` if its digest is `expected`.
    pub fn get(&self, pba: Pba, expected: &Digest) -> Option<Arc<[u8]>> {
        let mut cache = self.cache.lock();
        let hit = cache
            .get(&pba)
            .map(|(digest, block)| (digest == expected, block.clone()));
        match hit {
            Some((true, block)) => Some(block),
            Some((false, _)) => {
                cache.pop(&pba);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, pba: Pba, digest: Digest, block: Arc<[u8]>) {
        self.cache.lock().put(pba, (digest, block));
    }

    pub fn invalidate(&self, pba: Pba) {
        self.cache.lock().pop(&pba);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }
}
