//! Readiness polling.
//!
//! The event loop only sees [`ReadyEvent`]s: a token and a [`Readiness`] bit
//! set. [`MioPoller`] produces them from epoll (kqueue elsewhere); tests can
//! supply their own [`Poller`] to script exact event sequences.

use mio::{Events, Poll, Registry, Token};
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

/// Readiness bits reported for one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness(u8);

impl Readiness {
    pub const EMPTY: Readiness = Readiness(0);
    pub const READABLE: Readiness = Readiness(1 << 0);
    pub const WRITABLE: Readiness = Readiness(1 << 1);
    pub const ERROR: Readiness = Readiness(1 << 2);
    pub const HUP: Readiness = Readiness(1 << 3);
    pub const READ_CLOSED: Readiness = Readiness(1 << 4);
    pub const PRIORITY: Readiness = Readiness(1 << 5);

    #[inline]
    pub fn from_bits(bits: u8) -> Self {
        Readiness(bits)
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    pub fn intersects(self, other: Readiness) -> bool {
        self.0 & other.0 != 0
    }

    /// Which handler class this readiness dispatches to.
    ///
    /// Read wins over write, and write over the error class, so a socket that
    /// is readable and half-closed is read first and observes the EOF itself.
    pub fn class(self) -> Option<EventClass> {
        if self.intersects(Self::READABLE) {
            Some(EventClass::Read)
        } else if self.intersects(Self::WRITABLE) {
            Some(EventClass::Write)
        } else if self.intersects(Self::HUP | Self::ERROR | Self::READ_CLOSED) {
            Some(EventClass::Error)
        } else {
            None
        }
    }
}

impl BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

impl BitOrAssign for Readiness {
    fn bitor_assign(&mut self, rhs: Readiness) {
        self.0 |= rhs.0;
    }
}

impl From<&mio::event::Event> for Readiness {
    fn from(event: &mio::event::Event) -> Self {
        let mut readiness = Readiness::EMPTY;
        if event.is_readable() {
            readiness |= Readiness::READABLE;
        }
        if event.is_writable() {
            readiness |= Readiness::WRITABLE;
        }
        if event.is_error() {
            readiness |= Readiness::ERROR;
        }
        if event.is_read_closed() {
            readiness |= Readiness::READ_CLOSED;
        }
        if event.is_write_closed() {
            readiness |= Readiness::HUP;
        }
        if event.is_priority() {
            readiness |= Readiness::PRIORITY;
        }
        readiness
    }
}

/// Handler class selected by a readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Read,
    Write,
    /// Hang-up, socket error or peer half-close.
    Error,
}

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub token: Token,
    pub readiness: Readiness,
}

impl ReadyEvent {
    pub fn new(token: Token, readiness: Readiness) -> Self {
        Self { token, readiness }
    }
}

/// The polling mechanism a worker waits on.
pub trait Poller: Send {
    /// Registry connections are registered with.
    fn registry(&self) -> &Registry;

    /// Wait up to `timeout` and append at most `max_events` events to `out`.
    fn wait(
        &mut self,
        out: &mut Vec<ReadyEvent>,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> io::Result<()>;
}

/// Poller backed by `mio::Poll`.
pub struct MioPoller {
    poll: Poll,
    events: Events,
}

impl MioPoller {
    pub fn new(max_events: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(max_events.max(1)),
        })
    }
}

impl Poller for MioPoller {
    fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    fn wait(
        &mut self,
        out: &mut Vec<ReadyEvent>,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        // Edge-triggered: take no more events than the caller consumes.
        let max_events = max_events.max(1);
        if self.events.capacity() != max_events {
            self.events = Events::with_capacity(max_events);
        }

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        out.extend(
            self.events
                .iter()
                .map(|event| ReadyEvent::new(event.token(), Readiness::from(event))),
        );
        Ok(())
    }
}
