//! Per-thread freelist cache
//!
//! Each reader and worker thread fronts the global [`Pool`] with a local
//! cache of free entries and chunks, so the freelist mutex is only taken
//! for bulk refills and bulk returns. Worker caches flush back to the
//! pool when they grow past their threshold or when the pool runs dry,
//! so the reader side cannot starve behind hoarded caches.

use std::sync::Arc;

use super::{Chunk, Entry, Pool};

/// Thread-local front-end to the pool's freelists.
///
/// Not `Sync` by design: exactly one thread owns a cache.
pub struct LocalCache {
    pool: Arc<Pool>,
    entries: Vec<Entry>,
    chunks: Vec<Chunk>,
    /// Return-to-pool threshold for entries; 0 disables returning
    /// (the reader keeps what it takes, it is the allocating side)
    entry_high: usize,
    /// Return-to-pool threshold for chunks, entry threshold scaled by
    /// chunks-per-record
    chunk_high: usize,
}

impl LocalCache {
    pub(super) fn new(pool: Arc<Pool>, entry_high: usize) -> LocalCache {
        // full-arena capacity keeps every splice allocation-free
        let entries = Vec::with_capacity(pool.entry_total());
        let chunks = Vec::with_capacity(pool.chunk_total());
        let chunk_high = entry_high * pool.chunks_per_record();
        LocalCache {
            pool,
            entries,
            chunks,
            entry_high,
            chunk_high,
        }
    }

    /// Take one free entry, refilling from the global pool if the cache
    /// is empty. `None` means both the cache and the pool are exhausted.
    pub fn get_entry(&mut self) -> Option<Entry> {
        if self.entries.is_empty() {
            self.pool.take_free_entries(&mut self.entries);
        }
        self.entries.pop()
    }

    /// Bounded wait for the pool to replenish, then take one entry.
    /// Returns `None` if the wait timed out with the pool still empty.
    pub fn wait_refill(&mut self, timeout: std::time::Duration) -> Option<Entry> {
        self.pool.wait_for_entries(&mut self.entries, timeout);
        self.entries.pop()
    }

    /// Take one free chunk, refilling from the global pool if needed
    pub fn get_chunk(&mut self) -> Option<Chunk> {
        if self.chunks.is_empty() {
            self.pool.take_free_chunks(&mut self.chunks);
        }
        self.chunks.pop()
    }

    /// Reset a finished entry, reclaim its chunks into this cache, and
    /// return it to the cache, flushing to the pool past the threshold.
    pub fn recycle_entry(&mut self, mut entry: Entry) {
        entry.reset(&mut self.chunks);
        self.entries.push(entry);
        self.maybe_flush();
    }

    /// Push back an untouched free entry (reader-side drop paths)
    pub fn put_entry(&mut self, entry: Entry) {
        debug_assert_eq!(entry.state(), super::EntryState::Empty);
        self.entries.push(entry);
        self.maybe_flush();
    }

    /// Push back an unused chunk
    pub fn put_chunk(&mut self, chunk: Chunk) {
        self.chunks.push(chunk);
    }

    /// Return everything to the global pool (thread exit)
    pub fn flush(&mut self) {
        self.pool.return_free_entries(&mut self.entries);
        self.pool.return_free_chunks(&mut self.chunks);
    }

    /// Cached free entries
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Cached free chunks
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn maybe_flush(&mut self) {
        if self.entry_high == 0 {
            return;
        }
        // either freelist running dry forces the matching flush, so the
        // reader never starves behind a below-threshold worker cache
        let entries_dry = self.pool.free_entries() == 0;
        let chunks_dry = self.pool.free_chunks() == 0;
        if self.entries.len() > self.entry_high || (entries_dry && !self.entries.is_empty()) {
            self.pool.return_free_entries(&mut self.entries);
        }
        if self.chunks.len() > self.chunk_high
            || ((entries_dry || chunks_dry) && !self.chunks.is_empty())
        {
            self.pool.return_free_chunks(&mut self.chunks);
        }
    }
}
