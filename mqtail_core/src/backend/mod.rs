//! Message-queue backend contract
//!
//! Workers talk to the messaging system exclusively through these
//! traits. A backend implementation is selected at startup from
//! configuration and shared by every worker; each worker thread gets
//! its own private [`MqWorker`] connection object.
//!
//! Call order, which the pipeline guarantees:
//!
//! - [`MqBackend::global_init`] once, before any threads start; a
//!   failure aborts the daemon.
//! - [`MqBackend::init_connections`] once after `global_init`, before
//!   any worker is spawned; a failure aborts the daemon.
//! - [`MqBackend::worker_init`] once per worker thread at startup; a
//!   failure terminates that worker (it may be restarted).
//! - [`MqWorker::send`] repeatedly from the worker loop. A
//!   [`SendError::Recoverable`] discards that one record and continues;
//!   a [`SendError::Fatal`] triggers [`MqWorker::reconnect`] followed by
//!   exactly one resend.
//! - [`MqWorker::shutdown`] once per worker at thread exit,
//!   [`MqBackend::global_shutdown`] once at process exit; failures are
//!   logged and shutdown continues.

mod file;
mod partition;

pub use file::FileBackend;
pub use partition::partition_for_key;

use thiserror::Error;

use crate::error::MqtailResult;

/// Classification of a failed send, deciding whether the worker's
/// connection state is assumed still usable.
#[derive(Debug, Error)]
pub enum SendError {
    /// The record is lost but the connection is healthy; the worker
    /// logs and continues.
    #[error("recoverable send error: {0}")]
    Recoverable(String),

    /// The connection must be torn down and re-established before any
    /// further send can succeed.
    #[error("non-recoverable send error: {0}")]
    Fatal(String),
}

/// Process-wide half of a messaging implementation.
pub trait MqBackend: Send + Sync {
    /// Short backend name for logs and error messages
    fn name(&self) -> &'static str;

    /// Called once when the daemon initializes, before any other method
    fn global_init(&self, nworkers: usize) -> MqtailResult<()>;

    /// Initialize network connections, after `global_init` and before
    /// any worker threads exist
    fn init_connections(&self) -> MqtailResult<()>;

    /// Create the private connection object for one worker thread.
    /// Thread-safe; called once per worker at startup and again after
    /// each restart of that worker slot.
    fn worker_init(&self, worker_id: usize) -> MqtailResult<Box<dyn MqWorker>>;

    /// Called once when the daemon shuts down
    fn global_shutdown(&self) -> MqtailResult<()>;
}

/// Per-worker private connection object.
pub trait MqWorker: Send {
    /// Send one record. `key` is the shard/routing key, possibly empty.
    fn send(&mut self, data: &[u8], key: &[u8]) -> Result<(), SendError>;

    /// Implementation version, logged at connect time; failure is
    /// logged but non-fatal
    fn version(&self) -> MqtailResult<String>;

    /// Connection identity, logged at connect time and after reconnect;
    /// failure is logged but non-fatal
    fn client_id(&self) -> MqtailResult<String>;

    /// Tear down and re-establish the connection after a fatal send
    /// error. On success the handle is usable again (it may have been
    /// replaced internally).
    fn reconnect(&mut self) -> MqtailResult<()>;

    /// Release the connection at worker thread exit
    fn shutdown(&mut self) -> MqtailResult<()>;
}
