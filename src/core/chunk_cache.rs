//! Per-element LRU cache of chunks
//!
//! Each open chunked element owns one cache. Entries are whole chunks keyed
//! by their grid coordinates. A dirty entry is written back through the
//! [`ChunkStore`] before it is evicted, on [`ChunkCache::flush_all`], and on
//! resize. Recency is strict access order: every hit moves the entry to the
//! MRU end, so two entries never share a recency position.
//!
//! The underlying `LruCache` is unbounded; the capacity is enforced here so
//! that an eviction can write back (and fail) before the entry leaves.

use crate::core::error::{HdfError, Result};
use lru::LruCache;
use tracing::debug;

/// Chunk grid coordinates, one per dimension
pub type ChunkCoord = Vec<u32>;

/// Backing storage behind a chunk cache
pub trait ChunkStore {
    /// Stored bytes of a chunk, `None` if it was never written
    fn load(&mut self, coord: &[u32]) -> Result<Option<Vec<u8>>>;

    /// A chunk holding only the fill value
    fn blank(&self, coord: &[u32]) -> Vec<u8>;

    /// Persist a dirty chunk
    fn store(&mut self, coord: &[u32], data: &[u8]) -> Result<()>;

    /// Make sure the chunk has a table entry, allocating one if needed
    fn reserve(&mut self, coord: &[u32]) -> Result<()>;
}

#[derive(Debug)]
struct CacheEntry {
    data: Vec<u8>,
    dirty: bool,
}

/// Chunk cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Dirty chunks written to storage
    pub writebacks: u64,
    pub resident: usize,
    pub capacity: usize,
}

impl ChunkCacheStats {
    /// Calculate hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

pub struct ChunkCache {
    entries: LruCache<ChunkCoord, CacheEntry>,
    capacity: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    writebacks: u64,
}

impl ChunkCache {
    /// Create a cache holding at most `capacity` chunks (minimum 1)
    pub fn new(capacity: usize) -> Self {
        ChunkCache {
            entries: LruCache::unbounded(),
            capacity: capacity.max(1),
            hits: 0,
            misses: 0,
            evictions: 0,
            writebacks: 0,
        }
    }

    /// Chunk contents for reading; a miss loads the chunk (or synthesizes
    /// fill for a never-written one)
    pub fn get<S: ChunkStore>(&mut self, coord: &[u32], store: &mut S) -> Result<&[u8]> {
        let key = coord.to_vec();
        if self.entries.contains(&key) {
            self.hits += 1;
        } else {
            self.misses += 1;
            let data = match store.load(coord)? {
                Some(data) => data,
                None => store.blank(coord),
            };
            self.insert(key.clone(), CacheEntry { data, dirty: false }, store)?;
        }
        Ok(&self.resident(&key)?.data)
    }

    /// Chunk contents for writing; the entry is marked dirty and gets a
    /// table entry. With `load == false` the caller promises to overwrite
    /// the whole chunk, so a miss does not touch storage.
    pub fn get_mut<S: ChunkStore>(
        &mut self,
        coord: &[u32],
        store: &mut S,
        load: bool,
    ) -> Result<&mut [u8]> {
        let key = coord.to_vec();
        if self.entries.contains(&key) {
            self.hits += 1;
        } else {
            self.misses += 1;
            let stored = if load { store.load(coord)? } else { None };
            let data = stored.unwrap_or_else(|| store.blank(coord));
            self.insert(key.clone(), CacheEntry { data, dirty: false }, store)?;
        }
        store.reserve(coord)?;
        let entry = self.resident(&key)?;
        entry.dirty = true;
        Ok(&mut entry.data)
    }

    /// Replace a whole chunk and mark it dirty
    pub fn put<S: ChunkStore>(&mut self, coord: &[u32], data: Vec<u8>, store: &mut S) -> Result<()> {
        let key = coord.to_vec();
        if let Some(entry) = self.entries.get_mut(&key) {
            self.hits += 1;
            entry.data = data;
            entry.dirty = true;
        } else {
            self.misses += 1;
            self.insert(key, CacheEntry { data, dirty: true }, store)?;
        }
        store.reserve(coord)
    }

    /// Write back every dirty chunk in ascending coordinate order
    pub fn flush_all<S: ChunkStore>(&mut self, store: &mut S) -> Result<()> {
        let mut dirty: Vec<ChunkCoord> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(coord, _)| coord.clone())
            .collect();
        dirty.sort();

        for coord in dirty {
            if let Some(entry) = self.entries.peek_mut(&coord) {
                store.store(&coord, &entry.data)?;
                entry.dirty = false;
                self.writebacks += 1;
            }
        }
        Ok(())
    }

    /// Change the capacity. Dirty chunks are flushed; resident chunks stay
    /// until later insertions push them out.
    pub fn resize<S: ChunkStore>(&mut self, capacity: usize, store: &mut S) -> Result<()> {
        self.flush_all(store)?;
        self.capacity = capacity.max(1);
        debug!(capacity = self.capacity, resident = self.entries.len(), "chunk cache resized");
        Ok(())
    }

    pub fn contains(&self, coord: &[u32]) -> bool {
        self.entries.contains(&coord.to_vec())
    }

    pub fn is_dirty(&self, coord: &[u32]) -> bool {
        self.entries
            .peek(&coord.to_vec())
            .map_or(false, |entry| entry.dirty)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ChunkCacheStats {
        ChunkCacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            writebacks: self.writebacks,
            resident: self.entries.len(),
            capacity: self.capacity,
        }
    }

    fn insert<S: ChunkStore>(&mut self, key: ChunkCoord, entry: CacheEntry, store: &mut S) -> Result<()> {
        self.make_room(store)?;
        self.entries.push(key, entry);
        Ok(())
    }

    /// Evict LRU entries until one more fits
    fn make_room<S: ChunkStore>(&mut self, store: &mut S) -> Result<()> {
        while self.entries.len() >= self.capacity {
            let (coord, entry) = match self.entries.pop_lru() {
                Some(victim) => victim,
                None => break,
            };
            if entry.dirty {
                if let Err(err) = store.store(&coord, &entry.data) {
                    self.entries.push(coord, entry);
                    return Err(err);
                }
                self.writebacks += 1;
            }
            self.evictions += 1;
            debug!(?coord, dirty = entry.dirty, "evicted chunk");
        }
        Ok(())
    }

    fn resident(&mut self, key: &ChunkCoord) -> Result<&mut CacheEntry> {
        self.entries
            .get_mut(key)
            .ok_or_else(|| HdfError::corrupt(format!("chunk {:?} missing from cache", key)))
    }
}
