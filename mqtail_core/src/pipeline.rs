//! Pipeline assembly and lifecycle
//!
//! Wires the pool, queue, workers and monitor together from a
//! [`RelayConfig`] and a backend, in the required bring-up order:
//! backend global init, backend connection check, worker threads,
//! monitor. Shutdown reverses it after draining the queue.

use std::sync::Arc;

use crate::assembler::Assembler;
use crate::backend::MqBackend;
use crate::config::RelayConfig;
use crate::error::MqtailResult;
use crate::monitor::Monitor;
use crate::pool::Pool;
use crate::queue::SpmcQueue;
use crate::worker::Supervisor;

/// A running record pipeline. The reader side is driven through the
/// [`Assembler`] returned by [`Pipeline::start`]; this handle owns
/// everything downstream of it.
pub struct Pipeline {
    pool: Arc<Pool>,
    queue: Arc<SpmcQueue>,
    supervisor: Supervisor,
    monitor: Monitor,
    backend: Arc<dyn MqBackend>,
}

impl Pipeline {
    /// Bring up the whole pipeline. On success the caller feeds records
    /// through the returned [`Assembler`] and periodically calls
    /// [`tick`](Self::tick).
    pub fn start(
        config: &RelayConfig,
        backend: Arc<dyn MqBackend>,
    ) -> MqtailResult<(Pipeline, Assembler)> {
        config.validate()?;

        let pool = Pool::new(&config.pool_config())?;
        let queue = SpmcQueue::new(config.qlen_goal, config.max_records);
        let assembler = Assembler::new(&pool, &queue, config.pool_wait());

        log::info!("Initializing backend {}", backend.name());
        backend.global_init(config.nworkers)?;
        backend.init_connections()?;

        let mut supervisor = Supervisor::new(
            config.nworkers,
            config.thread_restarts,
            config.restart_pause(),
            &pool,
            &queue,
            &backend,
        );
        supervisor.start()?;

        let monitor = Monitor::start(
            config.monitor_interval(),
            &pool,
            &queue,
            &assembler.stats(),
        )?;

        Ok((
            Pipeline {
                pool,
                queue,
                supervisor,
                monitor,
                backend,
            },
            assembler,
        ))
    }

    /// Periodic health check; returns an error once the pipeline can no
    /// longer deliver records (every worker abandoned).
    pub fn tick(&mut self) -> MqtailResult<()> {
        self.supervisor.check()
    }

    /// Shared queue, for status inspection
    pub fn queue(&self) -> &Arc<SpmcQueue> {
        &self.queue
    }

    /// Total records sent across all workers so far
    pub fn total_sends(&self) -> u64 {
        self.supervisor.total_sends()
    }

    /// Orderly shutdown: push the reader's remaining records into the
    /// shared queue, let the workers drain it, then stop the monitor
    /// and the backend. Logs final statistics.
    pub fn shutdown(mut self, mut assembler: Assembler) {
        log::info!("Shutting down");
        assembler.flush();
        self.supervisor.halt();
        self.monitor.stop();
        if let Err(e) = self.backend.global_shutdown() {
            log::error!("Backend {} shutdown failed: {}", self.backend.name(), e);
        }

        self.pool.log_stats();
        self.queue.log_stats();
        assembler.stats().log_stats();
        self.supervisor.log_stats();
        log::info!("Exiting");
    }
}
