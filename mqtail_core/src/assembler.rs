//! Reader-facing record assembly API
//!
//! The component that decodes the external transaction log (out of
//! scope here) drives the pipeline through an [`Assembler`]: open an
//! entry for a transaction ID, append payload fragments and an optional
//! shard key, then submit. The assembler owns the reader's freelist
//! cache and the queue's single producer handle, so it must live on the
//! reader thread.
//!
//! Degradation is by shedding load, never by growing memory: when the
//! pool is exhausted the record is dropped and counted, oversized
//! fragments are rejected and counted, and fragments are truncated at
//! an embedded NUL.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::pool::{Entry, LocalCache, Pool};
use crate::queue::{QueueProducer, SpmcQueue};

/// Why an append or key operation was refused. All of these are
/// per-record conditions; the reader logs, counts and moves on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AppendError {
    /// The fragment would push the record past `max_reclen`; the entry
    /// is unchanged.
    #[error("record payload would exceed the configured maximum")]
    Overflow,

    /// The chunk pool is exhausted; the record cannot grow and should
    /// be discarded.
    #[error("no free chunks available")]
    NoFreeChunks,

    /// The key exceeds `max_keylen`; the entry's key is unchanged.
    #[error("key exceeds the configured maximum length")]
    KeyTooLong,
}

/// Reader-side counters, shared with the monitor.
#[derive(Default)]
pub struct ReaderStats {
    /// Records opened (or attempted)
    pub seen: AtomicU64,
    /// Records handed to the queue
    pub submitted: AtomicU64,
    /// Completed records recycled without payload
    pub nodata: AtomicU64,
    /// Records dropped because no entry was free
    pub nofree: AtomicU64,
    /// Records discarded mid-assembly (chunk exhaustion, parse aborts)
    pub discards: AtomicU64,
    /// Fragments truncated at an embedded NUL
    pub truncated: AtomicU64,
    /// Fragments rejected for payload overflow
    pub data_overflows: AtomicU64,
    /// Keys rejected for length
    pub key_overflows: AtomicU64,
    /// Records submitted without their terminal fragment
    pub incomplete: AtomicU64,
}

impl ReaderStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Log reader statistics, monitor-style
    pub fn log_stats(&self) {
        log::info!(
            "Reader: seen={} submitted={} nodata={} nofree={} discards={} \
             truncated={} data_overflows={} key_overflows={} incomplete={}",
            self.seen.load(Ordering::Relaxed),
            self.submitted.load(Ordering::Relaxed),
            self.nodata.load(Ordering::Relaxed),
            self.nofree.load(Ordering::Relaxed),
            self.discards.load(Ordering::Relaxed),
            self.truncated.load(Ordering::Relaxed),
            self.data_overflows.load(Ordering::Relaxed),
            self.key_overflows.load(Ordering::Relaxed),
            self.incomplete.load(Ordering::Relaxed),
        );
    }
}

/// Assembles per-transaction records and submits them to the workers.
pub struct Assembler {
    pool: Arc<Pool>,
    cache: LocalCache,
    producer: QueueProducer,
    stats: Arc<ReaderStats>,
    /// Bounded wait for a free entry before dropping a record;
    /// zero means drop immediately
    pool_wait: Duration,
}

impl Assembler {
    /// Build the reader-side front end. Claims the queue's single
    /// producer handle.
    pub fn new(pool: &Arc<Pool>, queue: &Arc<SpmcQueue>, pool_wait: Duration) -> Assembler {
        Assembler {
            pool: Arc::clone(pool),
            cache: pool.local_cache(0),
            producer: queue.producer(),
            stats: Arc::new(ReaderStats::default()),
            pool_wait,
        }
    }

    /// Shared handle to the reader counters, for the monitor
    pub fn stats(&self) -> Arc<ReaderStats> {
        Arc::clone(&self.stats)
    }

    /// Take a free entry and open it for `xid`. `None` means the pool
    /// was exhausted even after the configured bounded wait; the record
    /// is dropped and counted, never buffered elsewhere.
    pub fn open_record(&mut self, xid: u32) -> Option<Entry> {
        ReaderStats::bump(&self.stats.seen);
        let entry = self.cache.get_entry().or_else(|| {
            if self.pool_wait.is_zero() {
                return None;
            }
            self.cache.wait_refill(self.pool_wait)
        });
        match entry {
            Some(mut e) => {
                e.open(xid);
                self.pool.stats().note_occupied();
                Some(e)
            }
            None => {
                ReaderStats::bump(&self.stats.nofree);
                log::warn!("Data table exhausted, DISCARDING record XID={}", xid);
                None
            }
        }
    }

    /// Append one fragment, prefixed with the `&` field separator.
    /// The fragment is truncated at an embedded NUL (counted); a
    /// fragment that would overflow `max_reclen` leaves the entry
    /// unchanged and is counted.
    pub fn append(&mut self, entry: &mut Entry, data: &[u8]) -> Result<(), AppendError> {
        let nul = data.iter().position(|&b| b == 0);
        let data = match nul {
            Some(at) => &data[..at],
            None => data,
        };

        let need = entry.len() + 1 + data.len();
        if need > self.pool.max_reclen() {
            ReaderStats::bump(&self.stats.data_overflows);
            log::warn!(
                "XID={}: data too long, current length={}, DISCARDING fragment of {} bytes",
                entry.xid(),
                entry.len(),
                data.len()
            );
            return Err(AppendError::Overflow);
        }

        while entry.chunk_capacity() < need {
            match self.cache.get_chunk() {
                Some(chunk) => entry.attach_chunk(chunk),
                None => {
                    ReaderStats::bump(&self.stats.discards);
                    log::warn!("Chunks exhausted, XID={} cannot grow", entry.xid());
                    return Err(AppendError::NoFreeChunks);
                }
            }
        }

        // count the truncation only for fragments that get appended
        if let Some(at) = nul {
            ReaderStats::bump(&self.stats.truncated);
            log::debug!(
                "XID={}: fragment truncated at NUL (offset {})",
                entry.xid(),
                at
            );
        }

        entry.extend(b"&");
        entry.extend(data);
        self.pool.stats().note_data_len(entry.len());
        Ok(())
    }

    /// Set the shard/routing key; oversized keys are rejected and
    /// counted, leaving any previous key in place.
    pub fn set_key(&mut self, entry: &mut Entry, key: &[u8]) -> Result<(), AppendError> {
        if key.len() > self.pool.max_keylen() {
            ReaderStats::bump(&self.stats.key_overflows);
            log::warn!(
                "XID={}: key too long ({} bytes), DISCARDING key",
                entry.xid(),
                key.len()
            );
            return Err(AppendError::KeyTooLong);
        }
        entry.set_key(key);
        self.pool.stats().note_key_len(key.len());
        Ok(())
    }

    /// Submit a completed record to the workers. Records that never
    /// received payload are recycled without a send (counted as
    /// nodata). Wakes a worker per the queue-depth heuristic, plus the
    /// unconditional base case when every worker is asleep.
    pub fn submit(&mut self, mut entry: Entry) {
        if !entry.has_data() {
            ReaderStats::bump(&self.stats.nodata);
            self.recycle(entry);
            return;
        }
        if entry.is_incomplete() {
            ReaderStats::bump(&self.stats.incomplete);
        }
        log::debug!(
            "submit: XID={} len={} key=[{}]",
            entry.xid(),
            entry.len(),
            String::from_utf8_lossy(entry.key())
        );
        entry.set_done();
        self.producer.enqueue(entry);
        ReaderStats::bump(&self.stats.submitted);

        let queue = self.producer.queue();
        if queue.need_worker() || queue.all_waiting() {
            queue.wake_one();
        }
    }

    /// Abandon a partially assembled record, returning its entry and
    /// chunks to the reader cache.
    pub fn discard(&mut self, entry: Entry) {
        ReaderStats::bump(&self.stats.discards);
        self.recycle(entry);
    }

    /// Push any records still staged in the producer handle into the
    /// shared queue. Submitting already publishes each record; this is
    /// the idle-path and shutdown safety net.
    pub fn flush(&mut self) {
        self.producer.drain();
    }

    fn recycle(&mut self, entry: Entry) {
        self.pool.stats().note_released();
        self.cache.recycle_entry(entry);
    }
}
