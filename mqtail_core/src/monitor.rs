//! Periodic statistics monitor
//!
//! A background thread that logs pool, queue and reader counters at a
//! configured interval. The thread sleeps on a condvar so a stop
//! request takes effect immediately instead of waiting out the
//! interval.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::assembler::ReaderStats;
use crate::error::{MqtailError, MqtailResult};
use crate::pool::Pool;
use crate::queue::SpmcQueue;

struct StopFlag {
    stopped: Mutex<bool>,
    cond: Condvar,
}

/// Handle to the monitor thread. Dropping without `stop()` leaves the
/// thread running; `stop()` joins it.
pub struct Monitor {
    flag: Arc<StopFlag>,
    handle: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Spawn the monitor thread. An interval of zero disables
    /// monitoring and spawns nothing.
    pub fn start(
        interval: Duration,
        pool: &Arc<Pool>,
        queue: &Arc<SpmcQueue>,
        reader_stats: &Arc<ReaderStats>,
    ) -> MqtailResult<Monitor> {
        let flag = Arc::new(StopFlag {
            stopped: Mutex::new(false),
            cond: Condvar::new(),
        });
        if interval.is_zero() {
            log::info!("Monitoring thread not running");
            return Ok(Monitor { flag, handle: None });
        }
        let thread_flag = Arc::clone(&flag);
        let pool = Arc::clone(pool);
        let queue = Arc::clone(queue);
        let reader_stats = Arc::clone(reader_stats);
        let handle = thread::Builder::new()
            .name("mqtail-monitor".into())
            .spawn(move || run(interval, thread_flag, pool, queue, reader_stats))
            .map_err(|e| MqtailError::Spawn(format!("monitor: {}", e)))?;
        log::info!("Monitor thread running, interval {:?}", interval);
        Ok(Monitor {
            flag,
            handle: Some(handle),
        })
    }

    /// Signal the monitor to stop and wait for it to finish.
    pub fn stop(&mut self) {
        {
            let mut stopped = self.flag.stopped.lock();
            *stopped = true;
            self.flag.cond.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Monitor thread panicked");
            }
        }
    }
}

fn run(
    interval: Duration,
    flag: Arc<StopFlag>,
    pool: Arc<Pool>,
    queue: Arc<SpmcQueue>,
    reader_stats: Arc<ReaderStats>,
) {
    loop {
        {
            let mut stopped = flag.stopped.lock();
            if !*stopped {
                let _ = flag.cond.wait_for(&mut stopped, interval);
            }
            if *stopped {
                break;
            }
        }
        log_cycle(&pool, &queue, &reader_stats);
    }
    log::info!("Monitoring thread exiting");
}

fn log_cycle(pool: &Pool, queue: &SpmcQueue, reader_stats: &ReaderStats) {
    pool.log_stats();
    queue.log_stats();
    reader_stats.log_stats();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;

    #[test]
    fn test_monitor_stops_promptly() {
        let pool = Pool::new(&PoolConfig {
            max_records: 4,
            chunk_size: 32,
            max_reclen: 64,
            max_keylen: 8,
        })
        .unwrap();
        let queue = SpmcQueue::new(4, 4);
        let stats = Arc::new(ReaderStats::default());

        // a long interval would block a naive sleep-based stop
        let mut monitor =
            Monitor::start(Duration::from_secs(3600), &pool, &queue, &stats).unwrap();
        let started = std::time::Instant::now();
        monitor.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_zero_interval_spawns_nothing() {
        let pool = Pool::new(&PoolConfig {
            max_records: 4,
            chunk_size: 32,
            max_reclen: 64,
            max_keylen: 8,
        })
        .unwrap();
        let queue = SpmcQueue::new(4, 4);
        let stats = Arc::new(ReaderStats::default());

        let mut monitor = Monitor::start(Duration::ZERO, &pool, &queue, &stats).unwrap();
        assert!(monitor.handle.is_none());
        monitor.stop();
    }
}
