//! Error kinds for the worker engine.
//!
//! [`WorkerError`] covers everything that terminates the process: setup
//! failures and readiness events that violate the dispatch contract.
//! [`HandlerError`] is per-connection and only ever ends the connection it
//! was raised on.

use std::io;
use tracing::error;

/// Fatal worker conditions.
///
/// These are propagated out of the event loop and the lifecycle as values and
/// turned into process termination by [`fatal`] at the thread boundary.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to pin worker to core {core_id}: {source}")]
    Affinity {
        core_id: usize,
        #[source]
        source: io::Error,
    },

    #[error("worker {worker_id} failed to allocate batch buffers ({bytes} bytes)")]
    BufferAlloc { worker_id: usize, bytes: usize },

    #[error("worker {worker_id} runs in offload mode without a batch handle")]
    MissingBatch { worker_id: usize },

    #[error("readiness event for token {token:#x} carries unknown role tag {tag}")]
    UnknownRole { token: usize, tag: u8 },

    #[error("readiness event for token {token:#x} has unrecognized bits {bits:#04x}")]
    UnknownReadiness { token: usize, bits: u8 },

    #[error("readiness wait failed: {0}")]
    Poll(#[source] io::Error),

    #[error("poller registry unavailable: {0}")]
    Registry(#[source] io::Error),

    #[error("accelerator stopped accepting batches from worker {worker_id}")]
    AcceleratorGone { worker_id: usize },

    #[error("worker {worker_id} reported initialized twice")]
    AlreadyInitialized { worker_id: usize },
}

/// Per-connection handler failure. Any `Err` from a handler slot makes the
/// event loop force-close the connection through the close slot for its role.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("hang-up or socket error reported by the poller")]
    Hangup,

    #[error("backend connect failed: {0}")]
    ConnectFailed(#[source] io::Error),

    #[error("offload handler invoked without a batch coordinator")]
    MissingBatch,

    #[error(transparent)]
    Io(#[from] io::Error),

    /// Raised inside a handler but not confined to its connection; the event
    /// loop escalates it instead of closing anything.
    #[error(transparent)]
    Fatal(#[from] WorkerError),
}

pub type HandlerResult = Result<(), HandlerError>;

/// Log a fatal worker error and terminate the process.
///
/// This is the only place the engine exits on its own; everything below the
/// worker thread boundary returns `Err(WorkerError)` instead.
#[inline(never)]
pub fn fatal(worker_id: usize, err: &WorkerError) -> ! {
    error!(worker_id, error = %err, "fatal worker error, terminating");
    std::process::exit(1);
}
