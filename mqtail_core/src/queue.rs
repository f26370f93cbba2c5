//! Single-producer multiple-consumer record queue
//!
//! The queue connecting the reader to the worker threads is split into
//! two shared segments under separate locks so the producer and the
//! consumers rarely contend: an enqueue-side segment the producer
//! appends to, and a dequeue-side segment consumers pop from, refilled
//! from the enqueue side by whole-list splice when it runs dry. Every
//! enqueue publishes under the enqueue lock, so a submitted record is
//! visible to consumers before the enqueue returns; a consumer never
//! sleeps while a submitted record exists.
//!
//! The queue is logically unbounded; memory stays bounded because every
//! queued record holds entries and chunks from the fixed upstream pool.
//! Consumers block on a condition variable when there is nothing to do;
//! the "keep running" flag is only modified under the waiter lock so a
//! halt cannot race a consumer into a missed wakeup. The wake heuristics
//! work from the count of live workers (announced by the worker threads
//! themselves), not the configured worker count, so exited or abandoned
//! slots never mute the all-asleep wakeup.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::pool::Entry;

/// The shared queue state. Create once, hand an [`Arc`] to every worker
/// and one [`QueueProducer`] to the reader.
pub struct SpmcQueue {
    /// Enqueue-side segment, touched by the producer (and by consumers
    /// only when the dequeue side runs dry)
    enq: Mutex<VecDeque<Entry>>,
    /// Dequeue-side segment, touched by consumers
    deq: Mutex<VecDeque<Entry>>,
    /// Total records in both segments
    len: AtomicUsize,
    /// Consumers currently blocked on the condition variable
    waiting: AtomicUsize,
    /// Cleared by `halt()`; read each loop iteration by workers
    run: AtomicBool,
    /// Guards the sleep/wake protocol together with `run`
    waiter_lock: Mutex<()>,
    datawaiter: Condvar,
    /// Cumulative submitted count, for the monitor
    submitted: AtomicUsize,
    /// Workers currently live (spawned and not exited), maintained by
    /// the worker threads; the wake heuristics divide by this
    live: AtomicUsize,
    qlen_goal: usize,
    producer_taken: AtomicBool,
}

impl SpmcQueue {
    pub fn new(qlen_goal: usize, capacity: usize) -> Arc<SpmcQueue> {
        Arc::new(SpmcQueue {
            enq: Mutex::new(VecDeque::with_capacity(capacity)),
            deq: Mutex::new(VecDeque::with_capacity(capacity)),
            len: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            run: AtomicBool::new(true),
            waiter_lock: Mutex::new(()),
            datawaiter: Condvar::new(),
            submitted: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            qlen_goal,
            producer_taken: AtomicBool::new(false),
        })
    }

    /// Claim the single producer handle. Panics if claimed twice; the
    /// reader is the only legal producer.
    pub fn producer(self: &Arc<Self>) -> QueueProducer {
        let taken = self.producer_taken.swap(true, Ordering::AcqRel);
        assert!(!taken, "SpmcQueue::producer may only be called once");
        QueueProducer {
            queue: Arc::clone(self),
            pending: VecDeque::new(),
        }
    }

    /// Pop the next record, refilling the dequeue side from the
    /// enqueue side when it is dry. `None` means the queue is empty.
    pub fn dequeue(&self) -> Option<Entry> {
        let mut deq = self.deq.lock();
        if deq.is_empty() {
            let mut enq = self.enq.lock();
            if !enq.is_empty() {
                // whole-list splice under both locks
                deq.append(&mut enq);
            }
        }
        let entry = deq.pop_front();
        if entry.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        entry
    }

    /// Records currently in the queue (all segments)
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cumulative count of records ever enqueued
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Consumers currently asleep on the condition variable
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    /// Whether the pipeline is still accepting normal operation (true
    /// until [`halt`](Self::halt))
    pub fn running(&self) -> bool {
        self.run.load(Ordering::Acquire)
    }

    /// Workers currently live. Worker threads announce themselves when
    /// they enter their run loop and retract on exit, so restarts and
    /// abandoned slots keep this accurate.
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub(crate) fn note_worker_up(&self) {
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_worker_down(&self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Proportional wake heuristic: wake another worker when the queue
    /// is deeper than the per-active-worker length goal would explain.
    /// Keeps active workers roughly proportional to queue depth. Based
    /// on the live worker count, so dead slots do not raise the bar.
    pub fn need_worker(&self) -> bool {
        let live = self.live_workers();
        if live == 0 {
            return false;
        }
        let active = live - self.waiting().min(live);
        self.len() > active * self.qlen_goal / live
    }

    /// Whether every live consumer is asleep, the base-case wake
    /// condition. Unsynchronized read; if it misses, the next submit
    /// wakes instead.
    pub fn all_waiting(&self) -> bool {
        let live = self.live_workers();
        live > 0 && self.waiting() >= live
    }

    /// Wake one sleeping consumer
    pub fn wake_one(&self) {
        let _guard = self.waiter_lock.lock();
        self.datawaiter.notify_one();
    }

    /// Block until data may be available or the queue is halted. The
    /// caller rechecks `dequeue()` after this returns; a return with an
    /// empty queue is allowed (spurious or halt wakeup).
    pub fn wait_for_data(&self) {
        let mut guard = self.waiter_lock.lock();
        // run and emptiness are both guaranteed fresh under the lock
        if self.running() && self.len() == 0 {
            self.waiting.fetch_add(1, Ordering::Relaxed);
            self.datawaiter.wait(&mut guard);
            self.waiting.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Clear the run flag and wake every consumer. Modified only under
    /// the waiter lock so no consumer can begin waiting after the
    /// broadcast and miss it.
    pub fn halt(&self) {
        let _guard = self.waiter_lock.lock();
        self.run.store(false, Ordering::Release);
        self.datawaiter.notify_all();
    }

    /// One stats line for the monitor
    pub fn log_stats(&self) {
        log::info!(
            "Queue: len={} submitted={} workers_live={} workers_waiting={}",
            self.len(),
            self.submitted(),
            self.live_workers(),
            self.waiting()
        );
    }

    fn note_enqueued(&self) {
        self.len.fetch_add(1, Ordering::Relaxed);
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }
}

/// The reader's enqueue handle; carries a staging list reused as the
/// splice source for each enqueue.
pub struct QueueProducer {
    queue: Arc<SpmcQueue>,
    pending: VecDeque<Entry>,
}

impl QueueProducer {
    /// Append a completed record. The record is spliced into the shared
    /// enqueue side before this returns, so consumers checking the queue
    /// afterwards always see it; `len` is bumped under the enqueue lock
    /// so a non-zero length implies a reachable record.
    pub fn enqueue(&mut self, entry: Entry) {
        self.pending.push_back(entry);
        let mut enq = self.queue.enq.lock();
        enq.append(&mut self.pending);
        self.queue.note_enqueued();
    }

    /// Push any leftover staged records into the shared enqueue side.
    /// `enqueue` already publishes each record; this remains as the
    /// idle-path and shutdown safety net.
    pub fn drain(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let mut enq = self.queue.enq.lock();
        enq.append(&mut self.pending);
    }

    /// Records still held in the staging list (zero after any enqueue)
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Shared queue this producer feeds
    pub fn queue(&self) -> &Arc<SpmcQueue> {
        &self.queue
    }
}
