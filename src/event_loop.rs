//! The per-worker event loop.
//!
//! Each iteration services the batch pipeline before any new I/O: a completed
//! generation is written back first, then pending client bytes are submitted,
//! and only then does the loop wait for readiness and dispatch the events
//! through the worker's handler table.
//!
//! Edge-triggered readiness does not repeat itself, so work a handler had to
//! defer is picked up by the loop: sessions waiting to close after their last
//! bytes are delivered, and reads paused at the high-water mark.

use crate::connection::{ConnId, Role};
use crate::error::{HandlerError, HandlerResult, WorkerError};
use crate::handlers::Handlers;
use crate::metrics::{EVENTS_DISPATCHED, FORCED_CLOSES};
use crate::poller::{EventClass, MioPoller, Poller, ReadyEvent};
use crate::sched::Sched;
use crate::worker::WorkerContext;
use std::mem;
use std::sync::atomic::Ordering;
use tracing::{debug, info, trace};

pub struct EventLoop<P = MioPoller> {
    sched: Sched<P>,
    handlers: Box<dyn Handlers>,
    ctx: WorkerContext,
    events: Vec<ReadyEvent>,
}

impl<P: Poller> EventLoop<P> {
    pub fn new(sched: Sched<P>, handlers: Box<dyn Handlers>, ctx: WorkerContext) -> Self {
        let events = Vec::with_capacity(sched.max_events);
        Self {
            sched,
            handlers,
            ctx,
            events,
        }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut WorkerContext {
        &mut self.ctx
    }

    pub fn sched(&self) -> &Sched<P> {
        &self.sched
    }

    pub fn sched_mut(&mut self) -> &mut Sched<P> {
        &mut self.sched
    }

    /// Run until the shutdown flag is raised.
    ///
    /// Any `Err` is fatal to the process; the caller hands it to
    /// [`crate::error::fatal`]. Once shutdown has been requested, errors from
    /// collaborators tearing down concurrently end the loop quietly instead.
    pub fn run(&mut self) -> Result<(), WorkerError> {
        let worker_id = self.ctx.worker_id;
        info!(worker_id, core_id = self.ctx.core_id, "Worker running");

        while !self.sched.shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.turn() {
                if self.sched.shutdown.load(Ordering::Relaxed) {
                    debug!(worker_id, error = %e, "Error during shutdown ignored");
                    break;
                }
                return Err(e);
            }
        }

        info!(worker_id, connections = self.ctx.conns.len(), "Worker shutting down");
        Ok(())
    }

    /// One iteration: admit sessions, service the batch, close and resume
    /// deferred connections, wait, dispatch.
    pub fn turn(&mut self) -> Result<(), WorkerError> {
        if let Some(intake) = &self.sched.intake {
            intake.admit(&mut self.ctx.conns);
        }

        self.service_batch()?;
        self.close_flushed();
        self.resume_reads()?;

        let mut events = mem::take(&mut self.events);
        events.clear();
        let waited = self.sched.poller.wait(
            &mut events,
            self.sched.max_events,
            Some(self.sched.poll_timeout),
        );
        let result = waited
            .map_err(WorkerError::Poll)
            .and_then(|()| events.iter().try_for_each(|event| self.dispatch(*event)));
        self.events = events;
        result
    }

    /// Forward a completed generation, then stage and submit pending input.
    fn service_batch(&mut self) -> Result<(), WorkerError> {
        let Some(batch) = self.ctx.batch.as_mut() else {
            return Ok(());
        };

        let mut failed = Vec::new();
        if batch.has_new_result() {
            let report = batch.forward_completed(&mut self.ctx.conns);
            trace!(
                worker_id = self.ctx.worker_id,
                delivered = report.delivered,
                dropped = report.dropped,
                bytes = report.bytes,
                "Batch forwarded"
            );
            failed = report.failed;
        }
        batch.flush(&mut self.ctx.conns)?;

        for id in failed {
            if let Some(role) = self.ctx.conns.get(id).map(|conn| conn.role()) {
                self.force_close(id, role);
            }
        }
        Ok(())
    }

    /// Close connections that reached end of stream once everything they
    /// sent has been delivered.
    fn close_flushed(&mut self) {
        let batch = self.ctx.batch.as_ref();
        let ready = self
            .ctx
            .conns
            .take_flushed(|id| batch.is_some_and(|batch| batch.holds(id)));
        for id in ready {
            if let Some(role) = self.ctx.conns.get(id).map(|conn| conn.role()) {
                debug!(conn_id = ?id, ?role, "Input delivered, closing");
                self.close(id, role);
            }
        }
    }

    /// Re-enter the read slot of connections that drained below the
    /// high-water mark.
    fn resume_reads(&mut self) -> Result<(), WorkerError> {
        for id in self.ctx.conns.take_resumable() {
            let Some(role) = self.ctx.conns.get(id).map(|conn| conn.role()) else {
                continue;
            };
            trace!(conn_id = ?id, ?role, "Reads resumed");
            let result = match role {
                Role::Client => self.handlers.on_client_read(&mut self.ctx, id),
                Role::Server => self.handlers.on_server_read(&mut self.ctx, id),
            };
            self.settle(id, role, result)?;
        }
        Ok(())
    }

    /// Route one readiness event to its handler slot.
    ///
    /// Returns `Err` only for events that violate the dispatch contract; in
    /// that case no handler has run for the event.
    pub fn dispatch(&mut self, event: ReadyEvent) -> Result<(), WorkerError> {
        let Some(class) = event.readiness.class() else {
            return Err(WorkerError::UnknownReadiness {
                token: event.token.0,
                bits: event.readiness.bits(),
            });
        };

        let (id, tag) = ConnId::from_token(event.token);
        let role = match class {
            EventClass::Read | EventClass::Write => {
                Role::try_from(tag).map_err(|tag| WorkerError::UnknownRole {
                    token: event.token.0,
                    tag,
                })?
            }
            EventClass::Error => match self.ctx.conns.get(id) {
                Some(conn) => conn.role(),
                None => {
                    trace!(conn_id = ?id, "Event for closed connection skipped");
                    return Ok(());
                }
            },
        };

        if !self.ctx.conns.contains(id) {
            trace!(conn_id = ?id, ?class, "Event for closed connection skipped");
            return Ok(());
        }

        EVENTS_DISPATCHED.increment();
        let handlers = &self.handlers;
        let ctx = &mut self.ctx;
        let result = match (class, role) {
            (EventClass::Read, Role::Client) => handlers.on_client_read(ctx, id),
            (EventClass::Read, Role::Server) => handlers.on_server_read(ctx, id),
            (EventClass::Write, Role::Client) => handlers.on_client_write(ctx, id),
            (EventClass::Write, Role::Server) => handlers.on_server_write(ctx, id),
            (EventClass::Error, _) => handlers.on_error(ctx, id, event.readiness),
        };

        self.settle(id, role, result)
    }

    /// Escalate a fatal handler error; close the connection on any other.
    fn settle(&mut self, id: ConnId, role: Role, result: HandlerResult) -> Result<(), WorkerError> {
        match result {
            Ok(()) => Ok(()),
            Err(HandlerError::Fatal(e)) => Err(e),
            Err(e) => {
                debug!(conn_id = ?id, ?role, error = %e, "Handler failed, closing");
                self.force_close(id, role);
                Ok(())
            }
        }
    }

    /// Close `id` through the close slot for its role, once.
    fn force_close(&mut self, id: ConnId, role: Role) {
        FORCED_CLOSES.increment();
        self.close(id, role);
    }

    fn close(&mut self, id: ConnId, role: Role) {
        match role {
            Role::Client => self.handlers.on_client_close(&mut self.ctx, id),
            Role::Server => self.handlers.on_server_close(&mut self.ctx, id),
        }
    }
}
