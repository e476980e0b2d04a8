use super::{
    Handlers, close_session, close_when_flushed, connect_and_drain, drain, finish_read, hangup,
    is_eof, relay,
};
use crate::connection::ConnId;
use crate::error::{HandlerError, HandlerResult};
use crate::poller::Readiness;
use crate::worker::WorkerContext;
use tracing::trace;

/// Client reads are staged into the worker's batch; the accelerator output
/// is written to the backend by the batch coordinator. Everything the
/// backend sends goes back to the client as is.
#[derive(Debug, Default, Clone, Copy)]
pub struct Offload;

impl Handlers for Offload {
    fn on_client_read(&self, ctx: &mut WorkerContext, id: ConnId) -> HandlerResult {
        let Some(batch) = ctx.batch.as_mut() else {
            return Err(HandlerError::MissingBatch);
        };
        let Some(conn) = ctx.conns.get_mut(id) else {
            return Ok(());
        };

        if conn.has_pending_send() {
            conn.flush()?;
        }
        if ctx.conns.pause_reads(id) {
            trace!(conn_id = ?id, "Client reads paused");
            return Ok(());
        }
        let Some(conn) = ctx.conns.get_mut(id) else {
            return Ok(());
        };
        let read = conn.fill_recv();
        if !conn.recv_buf.is_empty() {
            let staged = batch.stage(id, &mut conn.recv_buf)?;
            trace!(conn_id = ?id, staged, pending = conn.recv_buf.len(), "Client read staged");
        }

        // Staged bytes still reach the backend after the client stops sending.
        if is_eof(&read) && (batch.holds(id) || ctx.conns.has_undelivered(id)) {
            close_when_flushed(&mut ctx.conns, id);
            return Ok(());
        }
        finish_read(read)
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
