//! Accelerator coordinator.
//!
//! Stands in for the device driver: a single thread takes submitted batches
//! from every worker, runs a [`Kernel`] over them and hands both buffers back
//! on the submitting worker's completion channel. It does not serve anything
//! until every worker has completed its initialization handshake.

use crate::batch::{BatchBuffer, Completion, Submission};
use crate::handshake::{InitFlag, wait_all};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Work executed over one submitted batch.
///
/// Every item written to `output` must carry the connection of the input item
/// it was produced from.
pub trait Kernel: Send {
    fn process(&mut self, input: &BatchBuffer, output: &mut BatchBuffer);
}

/// Copies every item unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Kernel for Passthrough {
    fn process(&mut self, input: &BatchBuffer, output: &mut BatchBuffer) {
        for (conn, payload) in input.iter() {
            if !output.push(conn, payload) {
                warn!(conn_id = ?conn, len = payload.len(), "Output buffer full, item dropped");
            }
        }
    }
}

pub struct Accelerator<K> {
    kernel: K,
    submissions: Receiver<Submission>,
    completions: Vec<Sender<Completion>>,
    workers: Vec<Arc<InitFlag>>,
    shutdown: Arc<AtomicBool>,
}

impl<K: Kernel + 'static> Accelerator<K> {
    /// `completions[i]` is the channel back to worker `i`, whose handshake
    /// flag is `workers[i]`.
    pub fn new(
        kernel: K,
        submissions: Receiver<Submission>,
        completions: Vec<Sender<Completion>>,
        workers: Vec<Arc<InitFlag>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            kernel,
            submissions,
            completions,
            workers,
            shutdown,
        }
    }

    /// Run the coordinator on its own thread.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("accelerator".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        while !wait_all(self.workers.iter().map(|flag| flag.as_ref()), IDLE_WAIT) {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
        }
        info!(workers = self.workers.len(), "Accelerator serving");

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.submissions.recv_timeout(IDLE_WAIT) {
                Ok(submission) => self.execute(submission),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("All workers gone, accelerator stopping");
                    break;
                }
            }
        }

        info!("Accelerator shutdown complete");
    }

    fn execute(&mut self, submission: Submission) {
        let Submission {
            worker_id,
            input,
            mut output,
        } = submission;

        let Some(completions) = self.completions.get(worker_id) else {
            warn!(worker_id, "Submission from unknown worker discarded");
            return;
        };

        self.kernel.process(&input, &mut output);
        trace!(worker_id, items = output.len(), "Batch complete");

        if completions.send(Completion { input, output }).is_err() {
            debug!(worker_id, "Worker gone, completion discarded");
        }
    }
}
