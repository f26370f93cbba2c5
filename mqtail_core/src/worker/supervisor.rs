//! Worker supervision
//!
//! The supervisor owns the worker threads. Workers that exit on their
//! own (a dead connection that could not be reestablished, or a failed
//! initialization) are restarted up to a configured number of times per
//! slot; past that the slot is abandoned. When every slot has been
//! abandoned the supervisor reports the pipeline as unrecoverable.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::backend::MqBackend;
use crate::error::{MqtailError, MqtailResult};
use crate::pool::Pool;
use crate::queue::SpmcQueue;
use crate::worker::{wrk_main, WorkerContext, WorkerSlot, WorkerState};

struct Slot {
    shared: Arc<WorkerSlot>,
    handle: Option<JoinHandle<()>>,
}

/// Spawns, restarts and finally joins the worker threads.
pub struct Supervisor {
    slots: Vec<Slot>,
    pool: Arc<Pool>,
    queue: Arc<SpmcQueue>,
    backend: Arc<dyn MqBackend>,
    thread_restarts: u32,
    restart_pause: Duration,
    abandoned: usize,
}

impl Supervisor {
    pub fn new(
        nworkers: usize,
        thread_restarts: u32,
        restart_pause: Duration,
        pool: &Arc<Pool>,
        queue: &Arc<SpmcQueue>,
        backend: &Arc<dyn MqBackend>,
    ) -> Supervisor {
        let slots = (1..=nworkers)
            .map(|id| Slot {
                shared: WorkerSlot::new(id),
                handle: None,
            })
            .collect();
        Supervisor {
            slots,
            pool: Arc::clone(pool),
            queue: Arc::clone(queue),
            backend: Arc::clone(backend),
            thread_restarts,
            restart_pause,
            abandoned: 0,
        }
    }

    /// Spawn all worker threads. A spawn failure here is fatal; partial
    /// worker sets are not worth running at startup.
    pub fn start(&mut self) -> MqtailResult<()> {
        log::info!("Starting {} workers", self.slots.len());
        for i in 0..self.slots.len() {
            self.spawn_slot(i)?;
        }
        Ok(())
    }

    fn spawn_slot(&mut self, i: usize) -> MqtailResult<()> {
        let nworkers = self.slots.len();
        let id = self.slots[i].shared.id;
        let ctx = WorkerContext {
            slot: Arc::clone(&self.slots[i].shared),
            pool: Arc::clone(&self.pool),
            queue: Arc::clone(&self.queue),
            backend: Arc::clone(&self.backend),
            cache_high: self.pool.worker_cache_high(nworkers),
        };
        let handle = thread::Builder::new()
            .name(format!("mqtail-wrk-{}", id))
            .spawn(move || wrk_main(ctx))
            .map_err(|e| MqtailError::Spawn(format!("worker {}: {}", id, e)))?;
        self.slots[i].handle = Some(handle);
        Ok(())
    }

    /// Periodic health check: restart exited workers, and report an
    /// unrecoverable pipeline once every slot has been abandoned.
    pub fn check(&mut self) -> MqtailResult<()> {
        if self.abandoned == self.slots.len() {
            return Err(MqtailError::WorkersExhausted);
        }
        let exited: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.shared.state() == WorkerState::Exited)
            .map(|(i, _)| i)
            .collect();
        for i in exited {
            self.restart_slot(i)?;
        }
        if self.abandoned == self.slots.len() {
            return Err(MqtailError::WorkersExhausted);
        }
        Ok(())
    }

    /// Number of abandoned worker slots
    pub fn abandoned(&self) -> usize {
        self.abandoned
    }

    fn restart_slot(&mut self, i: usize) -> MqtailResult<()> {
        {
            let slot = &mut self.slots[i];
            if let Some(handle) = slot.handle.take() {
                if handle.join().is_err() {
                    log::error!("Worker {}: thread panicked", slot.shared.id);
                    slot.shared.set_failed(true);
                }
            }
            if slot.shared.restarts() >= self.thread_restarts {
                log::error!(
                    "Worker {}: too many restarts ({}), abandoning",
                    slot.shared.id,
                    slot.shared.restarts()
                );
                slot.shared.set_state(WorkerState::Abandoned);
                self.abandoned += 1;
                return Ok(());
            }
            log::warn!(
                "Worker {}: restarting (restart {} of {})",
                slot.shared.id,
                slot.shared.restarts() + 1,
                self.thread_restarts
            );
            slot.shared.note_restart();
            slot.shared.stats.reset();
            slot.shared.set_state(WorkerState::NotStarted);
        }
        if !self.restart_pause.is_zero() {
            thread::sleep(self.restart_pause);
        }
        self.spawn_slot(i)
    }

    /// Stop the pipeline: signal shutdown through the queue and join
    /// every live worker thread.
    pub fn halt(&mut self) {
        log::info!("Halting workers");
        self.queue.halt();
        for slot in &mut self.slots {
            if let Some(handle) = slot.handle.take() {
                if handle.join().is_err() {
                    log::error!("Worker {}: thread panicked", slot.shared.id);
                    slot.shared.set_failed(true);
                }
            }
            if slot.shared.failed() {
                log::warn!("Worker {}: finished in failed state", slot.shared.id);
            }
        }
    }

    /// One stats line per worker
    pub fn log_stats(&self) {
        for slot in &self.slots {
            slot.shared.log_stats();
        }
    }

    /// Total records sent across all workers
    pub fn total_sends(&self) -> u64 {
        self.slots
            .iter()
            .map(|s| s.shared.stats.sends.load(Ordering::Relaxed))
            .sum()
    }
}
