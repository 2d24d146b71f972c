use parking_lot::Mutex;
use std::collections::HashMap;
use xxhash_rust::xxh3::xxh3_64;

/// Cached total counts for `CachedTotal` queries.
///
/// Keys are hashes of the normalized query signature; entries are stamped
/// with the namespace generation and drop out when a mutation bumps it.
#[derive(Debug, Default)]
pub struct QueryCountCache {
    entries: Mutex<HashMap<u64, CacheEntry>>,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    total: usize,
    generation: u64,
}

impl QueryCountCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh total for the signature, if one was stored at the current
    /// generation.
    #[must_use]
    pub fn get(&self, signature: &str, generation: u64) -> Option<usize> {
        let key = xxh3_64(signature.as_bytes());
        let entries = self.entries.lock();
        entries
            .get(&key)
            .filter(|e| e.generation == generation)
            .map(|e| e.total)
    }

    pub fn put(&self, signature: &str, generation: u64, total: usize) {
        let key = xxh3_64(signature.as_bytes());
        self.entries.lock().insert(
            key,
            CacheEntry {
                total,
                generation,
            },
        );
    }
}
