//! Double-buffered exchange of work between a worker and the accelerator.
//!
//! Buffers move between threads by ownership: a worker sends its filled input
//! buffer together with an empty output buffer in a [`Submission`], and the
//! accelerator hands both back in a [`Completion`]. Neither side ever touches
//! a buffer the other currently owns.

mod buffer;
mod coordinator;

pub use buffer::{BatchBuffer, BatchItem, BatchState};
pub use coordinator::{BatchCoordinator, ForwardReport};

use crate::config::OffloadConfig;
use crossbeam_channel::{Receiver, Sender};

/// Buffer pool dimensions for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSizing {
    pub max_items: usize,
    pub max_bytes: usize,
    pub max_item_size: usize,
    pub input_buffers: usize,
    pub output_buffers: usize,
}

impl BatchSizing {
    /// Bytes the pools of one worker occupy once allocated.
    pub fn total_bytes(&self) -> usize {
        self.max_bytes
            .saturating_mul(self.input_buffers.saturating_add(self.output_buffers))
    }
}

impl From<&OffloadConfig> for BatchSizing {
    fn from(config: &OffloadConfig) -> Self {
        Self {
            max_items: config.batch_items,
            max_bytes: config.batch_bytes,
            max_item_size: config.max_item_size,
            input_buffers: config.input_buffers,
            output_buffers: config.output_buffers,
        }
    }
}

/// A filled input buffer and the output buffer the accelerator writes into.
#[derive(Debug)]
pub struct Submission {
    pub worker_id: usize,
    pub input: BatchBuffer,
    pub output: BatchBuffer,
}

/// Both buffers of a finished submission, returned to the worker.
#[derive(Debug)]
pub struct Completion {
    pub input: BatchBuffer,
    pub output: BatchBuffer,
}

/// What a worker needs to build its [`BatchCoordinator`]: the channel ends
/// and the pool sizing. Buffers themselves are allocated on the worker thread.
#[derive(Debug)]
pub struct BatchHandle {
    pub worker_id: usize,
    pub sizing: BatchSizing,
    pub submit: Sender<Submission>,
    pub completions: Receiver<Completion>,
}

impl BatchHandle {
    /// Create a worker's handle and the sender the accelerator completes on.
    pub fn new(
        worker_id: usize,
        sizing: BatchSizing,
        submit: Sender<Submission>,
    ) -> (Self, Sender<Completion>) {
        // At most one generation per worker is in flight.
        let (complete_tx, complete_rx) = crossbeam_channel::bounded(1);
        (
            Self {
                worker_id,
                sizing,
                submit,
                completions: complete_rx,
            },
            complete_tx,
        )
    }
}
