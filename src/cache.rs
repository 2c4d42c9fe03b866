//! In-memory cache for resolved records.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};
use tracing::trace;

use crate::record::{DEFAULT_RECORD_SIZE_LIMIT, WIRE_HEADER_LEN};

/// Default time an entry stays in the cache.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(10 * 60);
/// Default budget for the sum of all cached entries: 100 MiB.
pub const DEFAULT_CACHE_MAX_BYTES: usize = 100 * 1024 * 1024;

/// Options for the [`ResolutionCache`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long entries are kept after insertion.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Upper bound for the sum of all entry sizes, in bytes.
    pub max_bytes: usize,
    /// Upper bound for a single entry, in bytes.
    pub max_entry_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_CACHE_TTL,
            max_bytes: DEFAULT_CACHE_MAX_BYTES,
            max_entry_size: DEFAULT_RECORD_SIZE_LIMIT + WIRE_HEADER_LEN,
        }
    }
}

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum CacheError {
    #[snafu(display("entry of {size} bytes exceeds the entry limit of {limit} bytes"))]
    EntryTooLarge { size: usize, limit: usize },
}

/// A byte-bounded cache with a fixed time-to-live per entry.
///
/// Values are the serialized form of a response. When inserting would exceed the byte
/// budget, the least recently used entries are dropped first. Cloning is cheap and all
/// clones share the same entries.
#[derive(Debug, Clone)]
pub struct ResolutionCache {
    inner: Arc<Mutex<Inner>>,
    ttl: Duration,
    max_bytes: usize,
    max_entry_size: usize,
}

#[derive(derive_more::Debug)]
struct Inner {
    #[debug("LruCache")]
    entries: LruCache<String, Entry>,
    total_bytes: usize,
}

#[derive(Debug)]
struct Entry {
    value: Bytes,
    inserted: Instant,
}

impl ResolutionCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            })),
            ttl: config.ttl,
            max_bytes: config.max_bytes,
            max_entry_size: config.max_entry_size.min(config.max_bytes),
        }
    }

    /// Get a live entry. Expired entries are removed on access.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(key) {
            None => return None,
            Some(entry) if entry.inserted.elapsed() < self.ttl => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
        };
        if expired {
            trace!(key, "cache entry expired");
            inner.remove(key);
        }
        None
    }

    /// Insert or replace an entry, restarting its time-to-live.
    pub fn set(&self, key: &str, value: Bytes) -> Result<(), CacheError> {
        ensure!(
            value.len() <= self.max_entry_size,
            EntryTooLargeSnafu {
                size: value.len(),
                limit: self.max_entry_size
            }
        );
        let mut inner = self.inner.lock();
        inner.remove(key);
        inner.total_bytes += value.len();
        inner.entries.put(
            key.to_string(),
            Entry {
                value,
                inserted: Instant::now(),
            },
        );
        while inner.total_bytes > self.max_bytes {
            let Some((key, entry)) = inner.entries.pop_lru() else {
                break;
            };
            trace!(%key, "evicting cache entry");
            inner.total_bytes -= entry.value.len();
        }
        Ok(())
    }

    /// Number of entries, including expired ones not yet removed.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of all entry sizes.
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }
}

impl Inner {
    fn remove(&mut self, key: &str) {
        if let Some(old) = self.entries.pop(key) {
            self.total_bytes -= old.value.len();
        }
    }
}
