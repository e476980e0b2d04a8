//! Per-worker scheduler state.

use crate::handshake::InitFlag;
use crate::poller::{MioPoller, Poller};
use crate::session::SessionIntake;
use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// Everything the event loop needs from the polling side: the poller, how
/// many events one wait may return, how long it may block, the worker's
/// handshake flag and the shutdown flag checked at the top of each iteration.
pub struct Sched<P = MioPoller> {
    pub poller: P,
    pub max_events: usize,
    pub poll_timeout: Duration,
    pub init: Arc<InitFlag>,
    pub shutdown: Arc<AtomicBool>,
    pub intake: Option<SessionIntake>,
}

impl Sched<MioPoller> {
    /// Scheduler over a fresh `mio::Poll`.
    pub fn with_mio(
        max_events: usize,
        poll_timeout: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        Ok(Self::new(
            MioPoller::new(max_events)?,
            max_events,
            poll_timeout,
            shutdown,
        ))
    }
}

impl<P: Poller> Sched<P> {
    pub fn new(
        poller: P,
        max_events: usize,
        poll_timeout: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            poller,
            max_events,
            poll_timeout,
            init: Arc::new(InitFlag::new()),
            shutdown,
            intake: None,
        }
    }

    /// Attach the inbox new sessions arrive on.
    pub fn with_intake(mut self, intake: SessionIntake) -> Self {
        self.intake = Some(intake);
        self
    }

    /// The handshake flag observers wait on.
    pub fn init_flag(&self) -> Arc<InitFlag> {
        self.init.clone()
    }
}
