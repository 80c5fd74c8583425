//! Bounded in-memory chunk cache keyed by (path, chunk index).
//!
//! Serves every synchronous read; the backing store is only consulted by
//! background preloads. Entries are evicted by recency once the configured
//! entry count is exceeded.

use bytes::Bytes;
use moka::sync::Cache;

type ChunkKey = (String, u64);

#[derive(Clone)]
pub struct ChunkCache {
    inner: Cache<ChunkKey, Bytes>,
}

impl ChunkCache {
    pub fn new(max_entries: u64) -> Self {
        Self {
            inner: Cache::new(max_entries),
        }
    }

    pub fn get(&self, path: &str, chunk: u64) -> Option<Bytes> {
        self.inner.get(&(path.to_string(), chunk))
    }

    pub fn insert(&self, path: &str, chunk: u64, data: Bytes) {
        self.inner.insert((path.to_string(), chunk), data);
    }

    pub fn invalidate(&self, path: &str, chunk: u64) {
        self.inner.invalidate(&(path.to_string(), chunk));
    }

    /// Drop every cached chunk of `path` up to `chunk_count`.
    pub fn invalidate_file(&self, path: &str, chunk_count: u64) {
        for chunk in 0..chunk_count {
            self.invalidate(path, chunk);
        }
    }
}
