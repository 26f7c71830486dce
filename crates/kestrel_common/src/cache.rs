//! Bounded LRU artifact cache with a single-writer, multi-reader contract.
//!
//! The cache maps an opaque fingerprint key to a shared, refcounted
//! artifact. Eviction releases only the cache's share; readers holding an
//! `Arc` keep the artifact alive.
//!
//! The single-writer discipline is enforced in the type system rather
//! than by convention: `add_entry` needs `&mut ArtifactCache`, which is
//! not `Clone`, while any number of [`CacheReader`] handles may perform
//! concurrent lookups.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

struct LruState<T> {
    /// Keys in recency order; front = most recently used.
    recency: VecDeque<Vec<u8>>,
    map: HashMap<Vec<u8>, Arc<T>>,
}

struct CacheShared<T> {
    capacity: usize,
    state: Mutex<LruState<T>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<T> CacheShared<T> {
    fn lookup(&self, key: &[u8]) -> Option<Arc<T>> {
        let mut state = self.state.lock();
        if let Some(value) = state.map.get(key).cloned() {
            promote(&mut state.recency, key);
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(value)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

/// Move `key` to the front of the recency list.
fn promote(recency: &mut VecDeque<Vec<u8>>, key: &[u8]) {
    if recency.front().map(|k| k.as_slice()) == Some(key) {
        return;
    }
    if let Some(pos) = recency.iter().position(|k| k == key) {
        let k = recency.remove(pos).unwrap();
        recency.push_front(k);
    }
}

/// Owning handle: the sole writer.
pub struct ArtifactCache<T> {
    shared: Arc<CacheShared<T>>,
}

/// Shared read-only handle. Cheap to clone; lookups are safe concurrently
/// with each other and with the single writer.
pub struct CacheReader<T> {
    shared: Arc<CacheShared<T>>,
}

impl<T> Clone for CacheReader<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> ArtifactCache<T> {
    /// Cache holding at most `capacity` artifacts.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be > 0");
        Self {
            shared: Arc::new(CacheShared {
                capacity,
                state: Mutex::new(LruState {
                    recency: VecDeque::with_capacity(capacity),
                    map: HashMap::with_capacity(capacity),
                }),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    /// New read handle.
    pub fn reader(&self) -> CacheReader<T> {
        CacheReader {
            shared: self.shared.clone(),
        }
    }

    /// Insert `key -> value`, overwriting any prior entry for the key.
    /// The key is copied; the value is shared. If the insert exceeds
    /// capacity, the least-recently-used entry is evicted and the cache's
    /// share of that artifact released.
    pub fn add_entry(&mut self, key: &[u8], value: Arc<T>) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.map.insert(key.to_vec(), value).is_some() {
            promote(&mut state.recency, key);
            return;
        }
        state.recency.push_front(key.to_vec());
        if state.recency.len() > shared.capacity {
            if let Some(victim) = state.recency.pop_back() {
                state.map.remove(&victim);
                shared.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn lookup(&self, key: &[u8]) -> Option<Arc<T>> {
        self.shared.lookup(key)
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.shared.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.shared.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.shared.evictions.load(Ordering::Relaxed)
    }
}

impl<T> CacheReader<T> {
    /// Look up `key`, promoting it to most-recently-used on a hit.
    pub fn lookup(&self, key: &[u8]) -> Option<Arc<T>> {
        self.shared.lookup(key)
    }
}
