//! Handler table.
//!
//! A worker binds exactly one [`Handlers`] implementation at startup and keeps
//! it for its whole lifetime. The event loop picks the slot from the event's
//! readiness class and the connection's role; handlers never see the poller.

mod offload;
mod passthrough;

pub use offload::Offload;
pub use passthrough::Passthrough;

use crate::connection::{ConnId, ConnectionTable};
use crate::error::{HandlerError, HandlerResult};
use crate::poller::Readiness;
use crate::worker::WorkerContext;
use std::io;
use tracing::{debug, trace};

/// Which handler table a worker binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Client reads go through the accelerator batch pipeline.
    Offload,
    /// Symmetric forwarding without batching.
    Passthrough,
}

/// The seven handler slots.
///
/// An `Err` from any fallible slot makes the event loop force-close the
/// connection through the close slot matching its role. Close slots must
/// tolerate a connection that is already gone.
pub trait Handlers: Send {
    fn on_client_read(&self, ctx: &mut WorkerContext, id: ConnId) -> HandlerResult;

    fn on_server_read(&self, ctx: &mut WorkerContext, id: ConnId) -> HandlerResult;

    fn on_client_write(&self, ctx: &mut WorkerContext, id: ConnId) -> HandlerResult;

    fn on_server_write(&self, ctx: &mut WorkerContext, id: ConnId) -> HandlerResult;

    /// Hang-up, socket error or peer half-close, for either role.
    fn on_error(&self, ctx: &mut WorkerContext, id: ConnId, readiness: Readiness)
    -> HandlerResult;

    fn on_client_close(&self, ctx: &mut WorkerContext, id: ConnId);

    fn on_server_close(&self, ctx: &mut WorkerContext, id: ConnId);
}

/// Build the handler table for `mode`.
pub fn bind(mode: Mode) -> Box<dyn Handlers> {
    match mode {
        Mode::Offload => Box::new(Offload),
        Mode::Passthrough => Box::new(Passthrough),
    }
}

/// Read what is available on `id` and forward it to its peer.
///
/// Bytes read before an end of stream are forwarded before the EOF is
/// handled; if the peer cannot take them yet, the session closes once it
/// has. The connection's own queued output is written first: with
/// edge-triggered readiness a write edge that arrives together with a read
/// edge is only dispatched to the read slot. Nothing is read while the peer
/// has a high-water mark's worth of bytes queued.
pub(crate) fn relay(conns: &mut ConnectionTable, id: ConnId) -> HandlerResult {
    let Some(conn) = conns.get_mut(id) else {
        return Ok(());
    };
    if conn.has_pending_send() {
        conn.flush()?;
    }
    if conns.pause_reads(id) {
        trace!(conn_id = ?id, "Reads paused");
        return Ok(());
    }
    let Some(conn) = conns.get_mut(id) else {
        return Ok(());
    };
    let read = conn.fill_recv();
    let peer = conn.peer;
    let data = conn.recv_buf.split();

    if !data.is_empty() {
        let Some(peer) = peer.filter(|p| conns.contains(*p)) else {
            return Err(HandlerError::PeerClosed);
        };
        conns.send(peer, &data)?;
        trace!(from = ?id, to = ?peer, len = data.len(), "Relayed");
    }

    if is_eof(&read) && conns.has_undelivered(id) {
        close_when_flushed(conns, id);
        return Ok(());
    }
    finish_read(read)
}

pub(crate) fn is_eof(read: &io::Result<usize>) -> bool {
    matches!(read, Err(e) if e.kind() == io::ErrorKind::UnexpectedEof)
}

/// Defer closing `id` until what it sent has been delivered.
pub(crate) fn close_when_flushed(conns: &mut ConnectionTable, id: ConnId) {
    trace!(conn_id = ?id, "End of stream, closing after flush");
    conns.close_when_flushed(id);
}

/// Map the outcome of a receive into a handler result.
pub(crate) fn finish_read(read: io::Result<usize>) -> HandlerResult {
    match read {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(HandlerError::PeerClosed),
        Err(e) => Err(e.into()),
    }
}

/// Write queued bytes; used for client writability and connected servers.
pub(crate) fn drain(conns: &mut ConnectionTable, id: ConnId) -> HandlerResult {
    if let Some(conn) = conns.get_mut(id) {
        conn.flush()?;
    }
    Ok(())
}

/// Complete a pending backend connect, then write queued bytes.
pub(crate) fn connect_and_drain(conns: &mut ConnectionTable, id: ConnId) -> HandlerResult {
    let Some(conn) = conns.get_mut(id) else {
        return Ok(());
    };
    if !conn.connected {
        conn.finish_connect().map_err(HandlerError::ConnectFailed)?;
        if conn.connected {
            debug!(conn_id = ?id, address = %conn.addr, "Backend connected");
        }
    }
    conn.flush()?;
    Ok(())
}

pub(crate) fn hangup(id: ConnId, readiness: Readiness) -> HandlerResult {
    trace!(conn_id = ?id, bits = readiness.bits(), "Hang-up");
    Err(HandlerError::Hangup)
}

/// Close a connection and the other half of its session.
pub(crate) fn close_session(conns: &mut ConnectionTable, id: ConnId) {
    let Some(conn) = conns.remove(id) else {
        return;
    };
    if let Some(peer) = conn.peer {
        if let Some(mut peer) = conns.remove(peer) {
            // Best effort: hand over whatever the closing side already sent.
            let _ = peer.flush();
        }
    }
    debug!(conn_id = ?id, role = ?conn.role(), address = %conn.addr, "Session closed");
}
