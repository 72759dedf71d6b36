/// Process-wide cache of decrypted group fields.
///
/// Keyed by BLAKE3(group id || ciphertext) so entries from different groups
/// never collide even for identical ciphertext bytes. Bounded LRU; a miss
/// only costs a recomputation.

use lru::LruCache;
use once_cell::sync::Lazy;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use crate::groups::ids::GroupIdentifier;
use crate::limits::DECRYPT_CACHE_CAPACITY;

static DECRYPT_CACHE: Lazy<Mutex<LruCache<[u8; 32], Vec<u8>>>> = Lazy::new(|| {
    let capacity = NonZeroUsize::new(DECRYPT_CACHE_CAPACITY)
        .unwrap_or(NonZeroUsize::MIN);
    Mutex::new(LruCache::new(capacity))
});

/// Cache key for a ciphertext scoped to one group.
pub(crate) fn cache_key(group_id: &GroupIdentifier, ciphertext: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(group_id.as_bytes());
    hasher.update(ciphertext);
    *hasher.finalize().as_bytes()
}

/// Look up a previously decrypted plaintext.
pub(crate) fn lookup(key: &[u8; 32]) -> Option<Vec<u8>> {
    match DECRYPT_CACHE.lock() {
        Ok(mut cache) => cache.get(key).cloned(),
        Err(_) => None,
    }
}

/// Record a decrypted (or just-encrypted) plaintext.
pub(crate) fn store(key: [u8; 32], plaintext: &[u8]) {
    if let Ok(mut cache) = DECRYPT_CACHE.lock() {
        cache.put(key, plaintext.to_vec());
        log::trace!("decrypt cache size: {}", cache.len());
    }
}

#[cfg(test)]
pub(crate) fn clear() {
    if let Ok(mut cache) = DECRYPT_CACHE.lock() {
        cache.clear();
    }
}
