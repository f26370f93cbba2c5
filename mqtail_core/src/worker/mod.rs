//! Worker threads
//!
//! Each worker drains the SPMC queue, serializes entry payloads and
//! sends them to the backend. Send failures are classified by the
//! backend: a recoverable error discards that one record and keeps the
//! connection; a non-recoverable error triggers one reconnect and one
//! resend, after which a still-failing worker marks itself failed and
//! exits, leaving restart decisions to the supervisor. On shutdown the
//! queue is fully drained before the worker exits, so no submitted
//! record is silently dropped.
//!
//! Entries and chunks are recycled back to the freelists on every path,
//! including failed sends. Buffers must never leak across a backend
//! outage.

mod supervisor;

pub use supervisor::Supervisor;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::backend::{MqBackend, MqWorker, SendError};
use crate::pool::{Entry, LocalCache, Pool};
use crate::queue::SpmcQueue;

/// Lifecycle state of a worker slot. `Abandoned` is terminal and only
/// ever entered by the supervisor's restart policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    NotStarted = 0,
    Initializing = 1,
    Running = 2,
    Waiting = 3,
    ShuttingDown = 4,
    Exited = 5,
    Abandoned = 6,
}

impl WorkerState {
    fn from_u8(v: u8) -> WorkerState {
        match v {
            0 => WorkerState::NotStarted,
            1 => WorkerState::Initializing,
            2 => WorkerState::Running,
            3 => WorkerState::Waiting,
            4 => WorkerState::ShuttingDown,
            5 => WorkerState::Exited,
            _ => WorkerState::Abandoned,
        }
    }

    /// Human-readable state name for logs
    pub fn name(&self) -> &'static str {
        match self {
            WorkerState::NotStarted => "not started",
            WorkerState::Initializing => "initializing",
            WorkerState::Running => "running",
            WorkerState::Waiting => "waiting",
            WorkerState::ShuttingDown => "shutting down",
            WorkerState::Exited => "exited",
            WorkerState::Abandoned => "abandoned",
        }
    }
}

/// Per-worker counters, mutated by the owning thread and read by the
/// monitor and supervisor.
#[derive(Default)]
pub struct WorkerStats {
    /// Records dequeued
    pub deqs: AtomicU64,
    /// Times the worker went to sleep on the queue
    pub waits: AtomicU64,
    /// Records sent successfully
    pub sends: AtomicU64,
    /// Records discarded after a failed send
    pub fails: AtomicU64,
    /// Recoverable send errors (record lost, connection kept)
    pub recoverables: AtomicU64,
    /// Successful reconnects after a non-recoverable error
    pub reconnects: AtomicU64,
}

impl WorkerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.deqs.store(0, Ordering::Relaxed);
        self.waits.store(0, Ordering::Relaxed);
        self.sends.store(0, Ordering::Relaxed);
        self.fails.store(0, Ordering::Relaxed);
        self.recoverables.store(0, Ordering::Relaxed);
        self.reconnects.store(0, Ordering::Relaxed);
    }
}

/// Shared descriptor for one worker slot. The worker thread mutates its
/// own state and counters; the supervisor touches the state and the
/// restart counter only while the slot's thread is not running.
pub struct WorkerSlot {
    /// 1-based worker number, stable across restarts of the slot
    pub id: usize,
    state: AtomicU8,
    failed: AtomicBool,
    restarts: AtomicU32,
    /// Per-worker counters
    pub stats: WorkerStats,
}

impl WorkerSlot {
    pub(crate) fn new(id: usize) -> Arc<WorkerSlot> {
        Arc::new(WorkerSlot {
            id,
            state: AtomicU8::new(WorkerState::NotStarted as u8),
            failed: AtomicBool::new(false),
            restarts: AtomicU32::new(0),
            stats: WorkerStats::default(),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether the last run of this slot ended in failure
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn set_failed(&self, failed: bool) {
        self.failed.store(failed, Ordering::Release);
    }

    /// How many times this slot has been restarted
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Acquire)
    }

    pub(crate) fn note_restart(&self) {
        self.restarts.fetch_add(1, Ordering::AcqRel);
    }

    /// One stats line for the monitor
    pub fn log_stats(&self) {
        log::info!(
            "Worker {} ({}): seen={} waits={} sent={} failed={} recoverables={} reconnects={} restarts={}",
            self.id,
            self.state().name(),
            self.stats.deqs.load(Ordering::Relaxed),
            self.stats.waits.load(Ordering::Relaxed),
            self.stats.sends.load(Ordering::Relaxed),
            self.stats.fails.load(Ordering::Relaxed),
            self.stats.recoverables.load(Ordering::Relaxed),
            self.stats.reconnects.load(Ordering::Relaxed),
            self.restarts(),
        );
    }
}

/// Everything a worker thread needs, built fresh per spawn.
pub(crate) struct WorkerContext {
    pub slot: Arc<WorkerSlot>,
    pub pool: Arc<Pool>,
    pub queue: Arc<SpmcQueue>,
    pub backend: Arc<dyn MqBackend>,
    /// Freelist cache return threshold for this worker
    pub cache_high: usize,
}

/// Outcome of processing one record, deciding whether the worker loop
/// continues.
#[derive(PartialEq, Eq)]
enum Disposition {
    Continue,
    /// Connection unusable even after reconnect; stop this worker
    Stop,
}

/// Worker thread body: initialize the backend connection, drain the
/// queue until halted, then drain what remains and shut down.
pub(crate) fn wrk_main(ctx: WorkerContext) {
    let slot = Arc::clone(&ctx.slot);
    log::info!("Worker {}: starting", slot.id);
    slot.set_failed(false);
    slot.set_state(WorkerState::Initializing);

    let mut conn = match ctx.backend.worker_init(slot.id) {
        Ok(conn) => conn,
        Err(e) => {
            log::error!("Worker {}: cannot initialize queue connection: {}", slot.id, e);
            slot.set_failed(true);
            slot.set_state(WorkerState::Exited);
            return;
        }
    };
    log_connection(conn.as_ref(), slot.id);

    let mut cache = ctx.pool.local_cache(ctx.cache_high);
    let mut buf: Vec<u8> = Vec::with_capacity(ctx.pool.max_reclen());

    // announce to the queue's wake heuristics; retracted on exit
    ctx.queue.note_worker_up();
    slot.set_state(WorkerState::Running);
    let mut stopped = false;
    while ctx.queue.running() {
        match ctx.queue.dequeue() {
            Some(entry) => {
                WorkerStats::bump(&slot.stats.deqs);
                if send_record(&ctx, conn.as_mut(), &mut cache, &mut buf, entry)
                    == Disposition::Stop
                {
                    stopped = true;
                    break;
                }
            }
            None => {
                // queue visibly empty; sleep until the producer wakes us
                // or shutdown is signaled
                slot.set_state(WorkerState::Waiting);
                WorkerStats::bump(&slot.stats.waits);
                ctx.queue.wait_for_data();
                slot.set_state(WorkerState::Running);
            }
        }
    }

    if !stopped {
        // shutdown: drain everything still queued so nothing submitted
        // is silently lost
        slot.set_state(WorkerState::ShuttingDown);
        while let Some(entry) = ctx.queue.dequeue() {
            WorkerStats::bump(&slot.stats.deqs);
            if send_record(&ctx, conn.as_mut(), &mut cache, &mut buf, entry)
                == Disposition::Stop
            {
                break;
            }
        }
    }

    ctx.queue.note_worker_down();
    cache.flush();
    if let Err(e) = conn.shutdown() {
        log::error!("Worker {}: backend worker shutdown failed: {}", slot.id, e);
        slot.set_failed(true);
    }
    log::info!("Worker {}: exiting", slot.id);
    slot.set_state(WorkerState::Exited);
}

/// Log the backend's version and connection identity at connect time;
/// failures here are noted but never fatal.
fn log_connection(conn: &dyn MqWorker, id: usize) {
    match conn.version() {
        Ok(version) => log::info!("Worker {}: backend version {}", id, version),
        Err(e) => log::warn!("Worker {}: cannot get backend version: {}", id, e),
    }
    match conn.client_id() {
        Ok(client) => log::info!("Worker {}: connected as {}", id, client),
        Err(e) => log::warn!("Worker {}: cannot get client ID: {}", id, e),
    }
}

/// Send one record with the reconnect-once-retry-once policy, then
/// recycle the entry whatever happened.
fn send_record(
    ctx: &WorkerContext,
    conn: &mut dyn MqWorker,
    cache: &mut LocalCache,
    buf: &mut Vec<u8>,
    entry: Entry,
) -> Disposition {
    let slot = &ctx.slot;
    entry.copy_payload_into(buf);

    let disposition = match conn.send(buf, entry.key()) {
        Ok(()) => {
            WorkerStats::bump(&slot.stats.sends);
            log::debug!("Worker {}: sent XID={} ({} bytes)", slot.id, entry.xid(), buf.len());
            Disposition::Continue
        }
        Err(SendError::Recoverable(msg)) => {
            WorkerStats::bump(&slot.stats.recoverables);
            log::warn!("Worker {}: recoverable send error: {}", slot.id, msg);
            log_discard(slot.id, &entry, buf);
            Disposition::Continue
        }
        Err(SendError::Fatal(msg)) => {
            log::error!("Worker {}: failed to send data: {}", slot.id, msg);
            retry_after_reconnect(ctx, conn, &entry, buf)
        }
    };

    ctx.pool.stats().note_released();
    cache.recycle_entry(entry);
    disposition
}

/// Recovery procedure after a non-recoverable send error: reconnect,
/// and if that works retry the same record exactly once.
fn retry_after_reconnect(
    ctx: &WorkerContext,
    conn: &mut dyn MqWorker,
    entry: &Entry,
    buf: &[u8],
) -> Disposition {
    let slot = &ctx.slot;
    match conn.reconnect() {
        Err(e) => {
            log::error!("Worker {}: reconnect failed: {}", slot.id, e);
            WorkerStats::bump(&slot.stats.fails);
            log_discard(slot.id, entry, buf);
            slot.set_failed(true);
            Disposition::Stop
        }
        Ok(()) => {
            WorkerStats::bump(&slot.stats.reconnects);
            log_connection(conn, slot.id);
            match conn.send(buf, entry.key()) {
                Ok(()) => {
                    WorkerStats::bump(&slot.stats.sends);
                    Disposition::Continue
                }
                Err(SendError::Recoverable(msg)) => {
                    WorkerStats::bump(&slot.stats.recoverables);
                    log::warn!("Worker {}: recoverable send error on retry: {}", slot.id, msg);
                    log_discard(slot.id, entry, buf);
                    Disposition::Continue
                }
                Err(SendError::Fatal(msg)) => {
                    log::error!("Worker {}: send failed again after reconnect: {}", slot.id, msg);
                    WorkerStats::bump(&slot.stats.fails);
                    log_discard(slot.id, entry, buf);
                    slot.set_failed(true);
                    Disposition::Stop
                }
            }
        }
    }
}

fn log_discard(id: usize, entry: &Entry, buf: &[u8]) {
    log::error!(
        "Worker {}: data DISCARDED XID={} [{}]",
        id,
        entry.xid(),
        String::from_utf8_lossy(buf)
    );
}
