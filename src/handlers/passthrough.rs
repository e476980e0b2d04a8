use super::{Handlers, close_session, connect_and_drain, drain, hangup, relay};
use crate::connection::ConnId;
use crate::error::HandlerResult;
use crate::poller::Readiness;
use crate::worker::WorkerContext;

/// Symmetric forwarding: whatever one side sends is written to the other.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Handlers for Passthrough {
    fn on_client_read(&self, ctx: &mut WorkerContext, id: ConnId) -> HandlerResult {
        relay(&mut ctx.conns, id)
    }

    fn on_server_read(&self, ctx: &mut WorkerContext, id: ConnId) -> HandlerResult {
        connect_and_drain(&mut ctx.conns, id)?;
        relay(&mut ctx.conns, id)
    }

    fn on_client_write(&self, ctx: &mut WorkerContext, id: ConnId) -> HandlerResult {
        drain(&mut ctx.conns, id)
    }

    fn on_server_write(&self, ctx: &mut WorkerContext, id: ConnId) -> HandlerResult {
        connect_and_drain(&mut ctx.conns, id)
    }

    fn on_error(
        &self,
        _ctx: &mut WorkerContext,
        id: ConnId,
        readiness: Readiness,
    ) -> HandlerResult {
        hangup(id, readiness)
    }

    fn on_client_close(&self, ctx: &mut WorkerContext, id: ConnId) {
        close_session(&mut ctx.conns, id);
    }

    fn on_server_close(&self, ctx: &mut WorkerContext, id: ConnId) {
        close_session(&mut ctx.conns, id);
    }
}
