//! Worker thread lifecycle.
//!
//! A worker moves through CREATED → AFFINITY_SET → HANDLERS_BOUND →
//! (BUFFERS_ALLOCATED) → INITIALIZED → RUNNING and never goes back. Every
//! setup failure is returned as a [`WorkerError`]; the thread that called
//! [`run`] turns it into process termination.

use crate::affinity::set_cpu_affinity;
use crate::batch::{BatchCoordinator, BatchHandle};
use crate::connection::ConnectionTable;
use crate::error::WorkerError;
use crate::event_loop::EventLoop;
use crate::handlers::{self, Mode};
use crate::poller::{MioPoller, Poller};
use crate::sched::Sched;
use tracing::debug;

/// Per-worker state handed to every handler invocation.
pub struct WorkerContext {
    pub worker_id: usize,
    pub core_id: usize,
    /// Live connections owned by this worker.
    pub conns: ConnectionTable,
    /// Present only in offload mode.
    pub batch: Option<BatchCoordinator>,
}

impl WorkerContext {
    pub fn new(
        worker_id: usize,
        core_id: usize,
        conns: ConnectionTable,
        batch: Option<BatchCoordinator>,
    ) -> Self {
        Self {
            worker_id,
            core_id,
            conns,
            batch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    AffinitySet,
    HandlersBound,
    BuffersAllocated,
    Initialized,
    Running,
}

/// What the dispatcher builds for one worker before spawning its thread.
pub struct WorkerSetup<P = MioPoller> {
    pub worker_id: usize,
    pub core_id: usize,
    pub sched: Sched<P>,
    /// Required in offload mode, ignored otherwise.
    pub batch: Option<BatchHandle>,
    /// Buffered bytes per connection at which reads pause.
    pub high_water: usize,
}

fn enter(worker_id: usize, state: WorkerState) {
    debug!(worker_id, ?state, "Worker state");
}

/// Perform every setup step and publish the handshake, returning the event
/// loop ready to run.
pub fn prepare<P: Poller>(setup: WorkerSetup<P>, mode: Mode) -> Result<EventLoop<P>, WorkerError> {
    let WorkerSetup {
        worker_id,
        core_id,
        sched,
        batch,
        high_water,
    } = setup;
    enter(worker_id, WorkerState::Created);

    set_cpu_affinity(core_id).map_err(|source| WorkerError::Affinity { core_id, source })?;
    enter(worker_id, WorkerState::AffinitySet);

    let handlers = handlers::bind(mode);
    enter(worker_id, WorkerState::HandlersBound);

    let registry = sched
        .poller
        .registry()
        .try_clone()
        .map_err(WorkerError::Registry)?;
    let conns = ConnectionTable::new(registry).with_high_water(high_water);

    let batch = match mode {
        Mode::Offload => {
            let handle = batch.ok_or(WorkerError::MissingBatch { worker_id })?;
            let coordinator = BatchCoordinator::allocate(handle)?;
            enter(worker_id, WorkerState::BuffersAllocated);
            Some(coordinator)
        }
        Mode::Passthrough => None,
    };

    let ctx = WorkerContext::new(worker_id, core_id, conns, batch);

    sched
        .init
        .set()
        .map_err(|_| WorkerError::AlreadyInitialized { worker_id })?;
    enter(worker_id, WorkerState::Initialized);

    Ok(EventLoop::new(sched, handlers, ctx))
}

/// Worker thread entry point. Returns only on shutdown or a fatal error.
pub fn run<P: Poller>(setup: WorkerSetup<P>, mode: Mode) -> Result<(), WorkerError> {
    let worker_id = setup.worker_id;
    let mut event_loop = prepare(setup, mode)?;
    enter(worker_id, WorkerState::Running);
    event_loop.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::allowed_cpus;
    use crate::batch::BatchSizing;
    use crate::batch::BatchState;
    use crate::connection::DEFAULT_HIGH_WATER;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn sched() -> Sched {
        Sched::with_mio(64, Duration::from_millis(1), Arc::new(AtomicBool::new(false))).unwrap()
    }

    fn core() -> usize {
        allowed_cpus().unwrap()[0]
    }

    #[test]
    fn test_passthrough_prepare_sets_flag() {
        let sched = sched();
        let flag = sched.init_flag();
        let setup = WorkerSetup {
            worker_id: 0,
            core_id: core(),
            sched,
            batch: None,
            high_water: DEFAULT_HIGH_WATER,
        };

        let event_loop = std::thread::spawn(move || prepare(setup, Mode::Passthrough).is_ok())
            .join()
            .unwrap();
        assert!(event_loop);
        assert!(flag.is_set());
    }

    #[test]
    fn test_offload_allocates_buffers() {
        let sched = sched();
        let flag = sched.init_flag();
        let (submit_tx, _submit_rx) = crossbeam_channel::unbounded();
        let sizing = BatchSizing {
            max_items: 4,
            max_bytes: 256,
            max_item_size: 64,
            input_buffers: 2,
            output_buffers: 2,
        };
        let (handle, _complete_tx) = BatchHandle::new(1, sizing, submit_tx);
        let setup = WorkerSetup {
            worker_id: 1,
            core_id: core(),
            sched,
            batch: Some(handle),
            high_water: DEFAULT_HIGH_WATER,
        };

        let state = std::thread::spawn(move || {
            let event_loop = prepare(setup, Mode::Offload).unwrap();
            event_loop.context().batch.as_ref().map(|b| b.state())
        })
        .join()
        .unwrap();
        assert_eq!(state, Some(BatchState::Empty));
        assert!(flag.is_set());
    }

    #[test]
    fn test_offload_without_handle_is_fatal() {
        let sched = sched();
        let flag = sched.init_flag();
        let setup = WorkerSetup {
            worker_id: 2,
            core_id: core(),
            sched,
            batch: None,
            high_water: DEFAULT_HIGH_WATER,
        };
        let result = std::thread::spawn(move || prepare(setup, Mode::Offload).err())
            .join()
            .unwrap();
        assert!(matches!(result, Some(WorkerError::MissingBatch { worker_id: 2 })));
        assert!(!flag.is_set());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_bad_core_is_fatal() {
        let sched = sched();
        let flag = sched.init_flag();
        let setup = WorkerSetup {
            worker_id: 3,
            core_id: usize::MAX,
            sched,
            batch: None,
            high_water: DEFAULT_HIGH_WATER,
        };
        let result = std::thread::spawn(move || prepare(setup, Mode::Passthrough).err())
            .join()
            .unwrap();
        assert!(matches!(
            result,
            Some(WorkerError::Affinity { core_id: usize::MAX, .. })
        ));
        assert!(!flag.is_set());
    }
}
