//! Pre-allocated record/chunk pool ("data table")
//!
//! The pool owns every [`Entry`] and [`Chunk`] the pipeline will ever
//! use. Everything is allocated once at startup; afterwards entries and
//! chunks only move between the global freelists, per-thread
//! [`LocalCache`]s, the queue and the owning threads. The global
//! freelists are guarded by a single mutex held only for O(1) list
//! splices, with no allocation, formatting or I/O while holding it. If
//! consumers fall behind, the freelists drain and the reader sheds load;
//! memory use is bounded by the arena for the life of the process.

mod cache;
mod entry;

pub use cache::LocalCache;
pub use entry::{Chunk, Entry, EntryState};

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{MqtailError, MqtailResult};

/// Sizing parameters for [`Pool::new`]
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of entries (maximum simultaneously open + queued records)
    pub max_records: usize,
    /// Payload chunk size in bytes
    pub chunk_size: usize,
    /// Maximum assembled record length in bytes
    pub max_reclen: usize,
    /// Maximum shard/routing key length in bytes
    pub max_keylen: usize,
}

/// Occupancy and high-water statistics, updated with relaxed atomics by
/// whichever thread currently owns the entry concerned.
#[derive(Default)]
pub struct PoolStats {
    occupied: AtomicUsize,
    occ_hi: AtomicUsize,
    data_hi: AtomicUsize,
    key_hi: AtomicUsize,
}

impl PoolStats {
    pub(crate) fn note_occupied(&self) {
        let occ = self.occupied.fetch_add(1, Ordering::Relaxed) + 1;
        self.occ_hi.fetch_max(occ, Ordering::Relaxed);
    }

    pub(crate) fn note_released(&self) {
        self.occupied.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn note_data_len(&self, len: usize) {
        self.data_hi.fetch_max(len, Ordering::Relaxed);
    }

    pub(crate) fn note_key_len(&self, len: usize) {
        self.key_hi.fetch_max(len, Ordering::Relaxed);
    }

    /// Entries currently taken from the freelists and holding a record
    pub fn occupied(&self) -> usize {
        self.occupied.load(Ordering::Relaxed)
    }

    /// High-water mark of simultaneously occupied entries
    pub fn occ_hi(&self) -> usize {
        self.occ_hi.load(Ordering::Relaxed)
    }

    /// Longest payload seen so far
    pub fn data_hi(&self) -> usize {
        self.data_hi.load(Ordering::Relaxed)
    }

    /// Longest key seen so far
    pub fn key_hi(&self) -> usize {
        self.key_hi.load(Ordering::Relaxed)
    }
}

struct FreeLists {
    entries: Vec<Entry>,
    chunks: Vec<Chunk>,
}

/// The arena of entries and chunks plus the global freelists.
///
/// Bulk `take_*`/`return_*` operations move whole lists under one lock;
/// individual gets and puts go through a per-thread [`LocalCache`].
pub struct Pool {
    free: Mutex<FreeLists>,
    /// Signaled when entries are returned, for bounded reader waits
    room: Condvar,
    /// Lock-free snapshots of the freelist lengths
    nfree_entries: AtomicUsize,
    nfree_chunks: AtomicUsize,
    entry_total: usize,
    chunk_total: usize,
    chunk_size: usize,
    chunks_per_record: usize,
    max_reclen: usize,
    max_keylen: usize,
    stats: PoolStats,
}

impl Pool {
    /// Allocate the arena. Fails fatally on nonsensical sizing or if the
    /// freelist capacity cannot be reserved; no other failure modes, and
    /// nothing is allocated after this returns.
    pub fn new(cfg: &PoolConfig) -> MqtailResult<Arc<Pool>> {
        if cfg.max_records == 0 || cfg.chunk_size == 0 || cfg.max_reclen == 0 {
            return Err(MqtailError::memory(
                "pool sizes (max_records, chunk_size, max_reclen) must be nonzero",
            ));
        }
        let chunks_per_record = (cfg.max_reclen + cfg.chunk_size - 1) / cfg.chunk_size;
        let entry_total = cfg.max_records;
        let chunk_total = cfg.max_records * chunks_per_record;

        let mut entries = Vec::new();
        entries
            .try_reserve_exact(entry_total)
            .map_err(|e| MqtailError::memory(format!("cannot reserve entry arena: {}", e)))?;
        let mut chunks = Vec::new();
        chunks
            .try_reserve_exact(chunk_total)
            .map_err(|e| MqtailError::memory(format!("cannot reserve chunk arena: {}", e)))?;

        for _ in 0..entry_total {
            entries.push(Entry::new(cfg.chunk_size, chunks_per_record, cfg.max_keylen));
        }
        for _ in 0..chunk_total {
            chunks.push(Chunk::new(cfg.chunk_size));
        }

        log::info!(
            "Pool: allocated {} entries, {} chunks of {} bytes ({} chunks/record)",
            entry_total,
            chunk_total,
            cfg.chunk_size,
            chunks_per_record
        );

        Ok(Arc::new(Pool {
            free: Mutex::new(FreeLists { entries, chunks }),
            room: Condvar::new(),
            nfree_entries: AtomicUsize::new(entry_total),
            nfree_chunks: AtomicUsize::new(chunk_total),
            entry_total,
            chunk_total,
            chunk_size: cfg.chunk_size,
            chunks_per_record,
            max_reclen: cfg.max_reclen,
            max_keylen: cfg.max_keylen,
            stats: PoolStats::default(),
        }))
    }

    /// Detach the entire global free-entry list into `dst`. Returns the
    /// number of entries taken.
    pub fn take_free_entries(&self, dst: &mut Vec<Entry>) -> usize {
        let mut free = self.free.lock();
        let taken = free.entries.len();
        splice(&mut free.entries, dst);
        self.nfree_entries.store(0, Ordering::Relaxed);
        taken
    }

    /// Prepend a caller-owned entry list back onto the global freelist
    pub fn return_free_entries(&self, src: &mut Vec<Entry>) {
        if src.is_empty() {
            return;
        }
        let mut free = self.free.lock();
        splice(src, &mut free.entries);
        self.nfree_entries
            .store(free.entries.len(), Ordering::Relaxed);
        drop(free);
        self.room.notify_all();
    }

    /// Detach the entire global free-chunk list into `dst`
    pub fn take_free_chunks(&self, dst: &mut Vec<Chunk>) -> usize {
        let mut free = self.free.lock();
        let taken = free.chunks.len();
        splice(&mut free.chunks, dst);
        self.nfree_chunks.store(0, Ordering::Relaxed);
        taken
    }

    /// Prepend a caller-owned chunk list back onto the global freelist
    pub fn return_free_chunks(&self, src: &mut Vec<Chunk>) {
        if src.is_empty() {
            return;
        }
        let mut free = self.free.lock();
        splice(src, &mut free.chunks);
        self.nfree_chunks
            .store(free.chunks.len(), Ordering::Relaxed);
    }

    /// Bounded wait for free entries, for the reader's optional blocking
    /// path. Takes whatever is available when woken (possibly nothing on
    /// timeout) and returns the count.
    pub fn wait_for_entries(&self, dst: &mut Vec<Entry>, timeout: Duration) -> usize {
        let mut free = self.free.lock();
        if free.entries.is_empty() {
            let _ = self.room.wait_for(&mut free, timeout);
        }
        let taken = free.entries.len();
        splice(&mut free.entries, dst);
        self.nfree_entries.store(0, Ordering::Relaxed);
        taken
    }

    /// Reset an entry owned by the caller, reclaiming its chunks into
    /// `freed`. Returns the number of chunks freed.
    pub fn reset_entry(&self, entry: &mut Entry, freed: &mut Vec<Chunk>) -> usize {
        entry.reset(freed)
    }

    /// Per-thread cache front-end for this pool. `entry_high` of zero
    /// disables the return threshold (reader side); workers pass
    /// `worker_cache_high(nworkers)`.
    pub fn local_cache(self: &Arc<Self>, entry_high: usize) -> LocalCache {
        LocalCache::new(Arc::clone(self), entry_high)
    }

    /// Return threshold for a worker cache: `max_records / (2 * nworkers)`,
    /// at least 1, so no worker hoards entries while the reader starves.
    pub fn worker_cache_high(&self, nworkers: usize) -> usize {
        (self.entry_total / (2 * nworkers.max(1))).max(1)
    }

    /// Current length of the global free-entry list (snapshot)
    pub fn free_entries(&self) -> usize {
        self.nfree_entries.load(Ordering::Relaxed)
    }

    /// Current length of the global free-chunk list (snapshot)
    pub fn free_chunks(&self) -> usize {
        self.nfree_chunks.load(Ordering::Relaxed)
    }

    /// Total number of entries in the arena
    pub fn entry_total(&self) -> usize {
        self.entry_total
    }

    /// Total number of chunks in the arena
    pub fn chunk_total(&self) -> usize {
        self.chunk_total
    }

    /// Chunk size in bytes
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Chunks needed for a maximum-length record
    pub fn chunks_per_record(&self) -> usize {
        self.chunks_per_record
    }

    /// Maximum assembled record length
    pub fn max_reclen(&self) -> usize {
        self.max_reclen
    }

    /// Maximum key length
    pub fn max_keylen(&self) -> usize {
        self.max_keylen
    }

    /// Occupancy and high-water statistics
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Log pool statistics, monitor-style
    pub fn log_stats(&self) {
        log::info!(
            "Pool: len={} free_entries={} free_chunks={} occupied={} occ_hi={} data_hi={} key_hi={}",
            self.entry_total,
            self.free_entries(),
            self.free_chunks(),
            self.stats.occupied(),
            self.stats.occ_hi(),
            self.stats.data_hi(),
            self.stats.key_hi()
        );
    }
}

/// Move all of `src` onto the tail of `dst`: a swap when `dst` is empty,
/// otherwise an append. Never allocates as long as both vectors were
/// sized for the arena.
fn splice<T>(src: &mut Vec<T>, dst: &mut Vec<T>) {
    if dst.is_empty() {
        mem::swap(src, dst);
    } else {
        dst.append(src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> Arc<Pool> {
        Pool::new(&PoolConfig {
            max_records: 8,
            chunk_size: 16,
            max_reclen: 64,
            max_keylen: 8,
        })
        .unwrap()
    }

    #[test]
    fn test_new_sizes_arena() {
        let pool = small_pool();
        assert_eq!(pool.entry_total(), 8);
        assert_eq!(pool.chunks_per_record(), 4);
        assert_eq!(pool.chunk_total(), 32);
        assert_eq!(pool.free_entries(), 8);
        assert_eq!(pool.free_chunks(), 32);
    }

    #[test]
    fn test_new_rejects_zero_sizes() {
        let err = Pool::new(&PoolConfig {
            max_records: 0,
            chunk_size: 16,
            max_reclen: 64,
            max_keylen: 8,
        });
        assert!(matches!(err, Err(MqtailError::Memory(_))));
    }

    #[test]
    fn test_take_and_return_conserve_entries() {
        let pool = small_pool();
        let mut local = Vec::with_capacity(8);

        let taken = pool.take_free_entries(&mut local);
        assert_eq!(taken, 8);
        assert_eq!(pool.free_entries(), 0);
        assert_eq!(local.len() + pool.free_entries(), pool.entry_total());

        // drop two entries into a second cache, return the rest
        let mut second: Vec<Entry> = local.drain(..2).collect();
        pool.return_free_entries(&mut local);
        assert_eq!(pool.free_entries(), 6);
        assert_eq!(
            second.len() + local.len() + pool.free_entries(),
            pool.entry_total()
        );

        pool.return_free_entries(&mut second);
        assert_eq!(pool.free_entries(), 8);
    }

    #[test]
    fn test_chunk_take_return_roundtrip() {
        let pool = small_pool();
        let mut chunks = Vec::with_capacity(32);
        assert_eq!(pool.take_free_chunks(&mut chunks), 32);
        assert_eq!(pool.free_chunks(), 0);
        pool.return_free_chunks(&mut chunks);
        assert_eq!(pool.free_chunks(), 32);
    }

    #[test]
    fn test_reset_entry_reclaims_chunks() {
        let pool = small_pool();
        let mut entries = Vec::new();
        let mut chunks = Vec::new();
        pool.take_free_entries(&mut entries);
        pool.take_free_chunks(&mut chunks);

        let mut e = entries.pop().unwrap();
        e.open(7);
        e.attach_chunk(chunks.pop().unwrap());
        e.attach_chunk(chunks.pop().unwrap());
        e.extend(b"0123456789abcdef0123");

        let mut freed = Vec::new();
        let n = pool.reset_entry(&mut e, &mut freed);
        assert_eq!(n, 2);
        assert_eq!(e.state(), EntryState::Empty);

        // everything accounted for
        entries.push(e);
        chunks.append(&mut freed);
        pool.return_free_entries(&mut entries);
        pool.return_free_chunks(&mut chunks);
        assert_eq!(pool.free_entries(), pool.entry_total());
        assert_eq!(pool.free_chunks(), pool.chunk_total());
    }

    #[test]
    fn test_wait_for_entries_times_out_empty() {
        let pool = small_pool();
        let mut sink = Vec::new();
        pool.take_free_entries(&mut sink);

        let mut dst = Vec::new();
        let taken = pool.wait_for_entries(&mut dst, Duration::from_millis(10));
        assert_eq!(taken, 0);
        assert!(dst.is_empty());
    }

    #[test]
    fn test_wait_for_entries_wakes_on_return() {
        let pool = small_pool();
        let mut sink = Vec::new();
        pool.take_free_entries(&mut sink);

        let pool2 = Arc::clone(&pool);
        let handle = std::thread::spawn(move || {
            let mut dst = Vec::new();
            pool2.wait_for_entries(&mut dst, Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(20));
        pool.return_free_entries(&mut sink);
        let taken = handle.join().unwrap();
        assert_eq!(taken, pool.entry_total());
    }

    #[test]
    fn test_occupancy_high_water() {
        let pool = small_pool();
        pool.stats().note_occupied();
        pool.stats().note_occupied();
        pool.stats().note_released();
        pool.stats().note_occupied();
        assert_eq!(pool.stats().occupied(), 2);
        assert_eq!(pool.stats().occ_hi(), 2);
    }
}
