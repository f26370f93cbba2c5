//! # mqtail core
//!
//! The core pipeline for the mqtail log relay daemon: a log tailer that
//! assembles transaction records from interleaved fragments and forwards
//! them to a message queue backend.
//!
//! The building blocks, in data-flow order:
//!
//! - **Pool**: pre-allocated entry and chunk storage with freelists, so
//!   the hot path never allocates
//! - **Assembler**: the reader-side API for opening, appending to and
//!   submitting records
//! - **Queue**: a single-producer multiple-consumer queue connecting the
//!   reader to the worker threads
//! - **Workers**: threads that serialize records and send them to the
//!   backend, with per-slot restart supervision
//! - **Backend**: the pluggable message queue interface and the bundled
//!   file backend
//! - **Monitor**: periodic statistics logging
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mqtail_core::{FileBackend, Pipeline, RelayConfig};
//!
//! # fn main() -> mqtail_core::MqtailResult<()> {
//! let config = RelayConfig::default();
//! let backend = Arc::new(FileBackend::new(&config.output_file, config.partitions));
//! let (mut pipeline, mut asm) = Pipeline::start(&config, backend)?;
//!
//! let mut entry = asm.open_record(4711).ok_or_else(|| {
//!     mqtail_core::MqtailError::memory("no free record entries")
//! })?;
//! match asm.append(&mut entry, b"url=/index.html") {
//!     Ok(()) => asm.submit(entry),
//!     Err(_) => asm.discard(entry),
//! }
//! asm.flush();
//!
//! pipeline.tick()?;
//! pipeline.shutdown(asm);
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod backend;
pub mod config;
pub mod error;
pub mod monitor;
pub mod pool;
pub mod queue;
pub mod worker;

mod pipeline;

pub use assembler::{AppendError, Assembler, ReaderStats};
pub use backend::{partition_for_key, FileBackend, MqBackend, MqWorker, SendError};
pub use config::RelayConfig;
pub use error::{MqtailError, MqtailResult};
pub use monitor::Monitor;
pub use pipeline::Pipeline;
pub use pool::{Entry, EntryState, Pool, PoolConfig, PoolStats};
pub use queue::{QueueProducer, SpmcQueue};
pub use worker::{Supervisor, WorkerSlot, WorkerState, WorkerStats};

// Re-export serde_yaml so binaries parse auxiliary YAML with the same
// version the config layer uses
pub use serde_yaml;
