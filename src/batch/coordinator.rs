//! Per-worker batch coordinator.

use super::{BatchBuffer, BatchHandle, BatchState, Completion, Submission};
use crate::connection::{ConnId, ConnectionTable};
use crate::error::WorkerError;
use crate::metrics::{
    BATCHES_FORWARDED, BATCHES_SUBMITTED, BYTES_FORWARDED, ITEMS_DROPPED, ITEMS_FORWARDED,
};
use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::collections::VecDeque;
use std::mem;
use tracing::{debug, trace, warn};

/// Outcome of writing one completed batch back to its connections.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ForwardReport {
    /// Items written to an open connection.
    pub delivered: usize,
    /// Items whose connection closed while the batch was in flight.
    pub dropped: usize,
    /// Payload bytes handed to connections.
    pub bytes: usize,
    /// Connections whose write failed; the caller force-closes them.
    pub failed: Vec<ConnId>,
}

/// Owns a worker's batch buffers and the exchange with the accelerator.
///
/// One input buffer is always filling. At most one generation is at the
/// accelerator or waiting to be forwarded, and its buffers only return to the
/// pools after [`forward_completed`](Self::forward_completed) drained them.
pub struct BatchCoordinator {
    worker_id: usize,
    max_item_size: usize,
    filling: BatchBuffer,
    spare_inputs: Vec<BatchBuffer>,
    spare_outputs: Vec<BatchBuffer>,
    in_flight: bool,
    ready: Option<Completion>,
    backlog: VecDeque<ConnId>,
    /// Connections with items in the outstanding generation.
    in_flight_conns: Vec<ConnId>,
    submit: Sender<Submission>,
    completions: Receiver<Completion>,
    accelerator_gone: bool,
}

impl BatchCoordinator {
    /// Allocate every buffer of the worker's pools up front.
    pub fn allocate(handle: BatchHandle) -> Result<Self, WorkerError> {
        let BatchHandle {
            worker_id,
            sizing,
            submit,
            completions,
        } = handle;

        let alloc = || {
            BatchBuffer::allocate(sizing.max_items, sizing.max_bytes).map_err(|_| {
                WorkerError::BufferAlloc {
                    worker_id,
                    bytes: sizing.total_bytes(),
                }
            })
        };

        let filling = alloc()?;
        let spare_inputs = (1..sizing.input_buffers)
            .map(|_| alloc())
            .collect::<Result<Vec<_>, _>>()?;
        let spare_outputs = (0..sizing.output_buffers)
            .map(|_| alloc())
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            worker_id,
            inputs = sizing.input_buffers,
            outputs = sizing.output_buffers,
            bytes = sizing.total_bytes(),
            "Batch buffers allocated"
        );

        Ok(Self {
            worker_id,
            max_item_size: sizing.max_item_size,
            filling,
            spare_inputs,
            spare_outputs,
            in_flight: false,
            ready: None,
            backlog: VecDeque::new(),
            in_flight_conns: Vec::with_capacity(sizing.max_items),
            submit,
            completions,
            accelerator_gone: false,
        })
    }

    /// State of the outstanding generation, or of the filling buffer when
    /// nothing is outstanding.
    pub fn state(&self) -> BatchState {
        if let Some(completion) = &self.ready {
            completion.output.state()
        } else if self.in_flight {
            BatchState::Submitted
        } else {
            self.filling.state()
        }
    }

    /// Items staged in the filling buffer.
    pub fn filling_len(&self) -> usize {
        self.filling.len()
    }

    /// Connections waiting for room in the filling buffer.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Whether items from `conn` are staged, backlogged or outstanding.
    pub fn holds(&self, conn: ConnId) -> bool {
        self.backlog.contains(&conn)
            || self.in_flight_conns.contains(&conn)
            || self.filling.iter().any(|(id, _)| id == conn)
    }

    /// Move bytes from a connection's receive buffer into the filling buffer.
    ///
    /// Returns false when some bytes had to stay behind because both the
    /// filling buffer is full and a generation is already in flight; the
    /// connection is then backlogged and re-staged by [`flush`](Self::flush).
    pub fn stage(&mut self, conn: ConnId, pending: &mut BytesMut) -> Result<bool, WorkerError> {
        while !pending.is_empty() {
            if self.filling.is_full() && !self.try_submit()? {
                break;
            }

            let take = pending
                .len()
                .min(self.max_item_size)
                .min(self.filling.remaining_bytes());
            if self.filling.state() == BatchState::Empty {
                self.filling.transition(BatchState::Filling);
            }
            if !self.filling.push(conn, &pending[..take]) {
                break;
            }
            let _ = pending.split_to(take);
        }

        if pending.is_empty() {
            return Ok(true);
        }
        if !self.backlog.contains(&conn) {
            trace!(worker_id = self.worker_id, conn_id = ?conn, "Batch full, connection backlogged");
            self.backlog.push_back(conn);
        }
        Ok(false)
    }

    /// Hand the filling buffer to the accelerator if nothing is in flight.
    ///
    /// Returns whether a submission was made.
    pub fn try_submit(&mut self) -> Result<bool, WorkerError> {
        if self.accelerator_gone {
            return Err(WorkerError::AcceleratorGone {
                worker_id: self.worker_id,
            });
        }
        if self.in_flight || self.filling.is_empty() {
            return Ok(false);
        }
        if self.spare_inputs.is_empty() || self.spare_outputs.is_empty() {
            return Ok(false);
        }
        let (Some(next), Some(mut output)) = (self.spare_inputs.pop(), self.spare_outputs.pop())
        else {
            return Ok(false);
        };

        let mut input = mem::replace(&mut self.filling, next);
        input.transition(BatchState::Submitted);
        output.transition(BatchState::Submitted);

        let items = input.len();
        self.in_flight_conns.clear();
        self.in_flight_conns.extend(input.iter().map(|(conn, _)| conn));
        self.in_flight_conns.dedup();
        let submission = Submission {
            worker_id: self.worker_id,
            input,
            output,
        };
        if self.submit.send(submission).is_err() {
            self.accelerator_gone = true;
            return Err(WorkerError::AcceleratorGone {
                worker_id: self.worker_id,
            });
        }

        self.in_flight = true;
        BATCHES_SUBMITTED.increment();
        trace!(worker_id = self.worker_id, items, "Batch submitted");
        Ok(true)
    }

    /// Non-blocking check for a completed generation.
    pub fn has_new_result(&mut self) -> bool {
        if self.ready.is_some() {
            return true;
        }
        if !self.in_flight {
            return false;
        }

        match self.completions.try_recv() {
            Ok(mut completion) => {
                completion.output.transition(BatchState::Ready);
                self.ready = Some(completion);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                if !self.accelerator_gone {
                    warn!(worker_id = self.worker_id, "Accelerator disconnected with a batch in flight");
                    self.accelerator_gone = true;
                }
                false
            }
        }
    }

    /// Write every item of the ready generation to its connection and return
    /// its buffers to the pools.
    ///
    /// Output goes to the peer of the item's originating connection. Items
    /// whose session closed in the meantime are dropped.
    pub fn forward_completed(&mut self, conns: &mut ConnectionTable) -> ForwardReport {
        let mut report = ForwardReport::default();
        let Some(Completion {
            mut input,
            mut output,
        }) = self.ready.take()
        else {
            return report;
        };

        output.transition(BatchState::Forwarding);
        for (origin, payload) in output.iter() {
            let dest = conns
                .get(origin)
                .and_then(|conn| conn.peer)
                .filter(|peer| conns.contains(*peer));

            let Some(dest) = dest else {
                ITEMS_DROPPED.increment();
                report.dropped += 1;
                trace!(conn_id = ?origin, "Dropping completed item for closed connection");
                continue;
            };

            match conns.send(dest, payload) {
                Ok(()) => {
                    report.delivered += 1;
                    report.bytes += payload.len();
                }
                Err(e) => {
                    debug!(conn_id = ?dest, error = %e, "Forward write failed");
                    if !report.failed.contains(&dest) {
                        report.failed.push(dest);
                    }
                }
            }
        }

        output.clear();
        output.transition(BatchState::Empty);
        input.clear();
        input.transition(BatchState::Empty);
        self.spare_outputs.push(output);
        self.spare_inputs.push(input);
        self.in_flight = false;
        self.in_flight_conns.clear();

        BATCHES_FORWARDED.increment();
        ITEMS_FORWARDED.add(report.delivered as u64);
        BYTES_FORWARDED.add(report.bytes as u64);
        report
    }

    /// Re-stage backlogged connections and submit a non-empty filling buffer
    /// when the accelerator is idle.
    pub fn flush(&mut self, conns: &mut ConnectionTable) -> Result<(), WorkerError> {
        let mut remaining = self.backlog.len();
        while remaining > 0 {
            remaining -= 1;
            let Some(id) = self.backlog.pop_front() else {
                break;
            };
            let Some(conn) = conns.get_mut(id) else {
                continue;
            };
            if !self.stage(id, &mut conn.recv_buf)? {
                break;
            }
        }

        self.try_submit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchSizing;
    use crate::connection::Role;
    use mio::Poll;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    fn sizing(max_items: usize, max_bytes: usize) -> BatchSizing {
        BatchSizing {
            max_items,
            max_bytes,
            max_item_size: max_bytes,
            input_buffers: 2,
            output_buffers: 2,
        }
    }

    fn coordinator(
        sizing: BatchSizing,
    ) -> (
        BatchCoordinator,
        Receiver<Submission>,
        Sender<Completion>,
    ) {
        let (submit_tx, submit_rx) = crossbeam_channel::unbounded();
        let (handle, complete_tx) = BatchHandle::new(0, sizing, submit_tx);
        (
            BatchCoordinator::allocate(handle).unwrap(),
            submit_rx,
            complete_tx,
        )
    }

    /// Play the accelerator: copy every item unchanged.
    fn complete(submissions: &Receiver<Submission>, completions: &Sender<Completion>) {
        let Submission {
            input, mut output, ..
        } = submissions.try_recv().expect("a submission");
        for (conn, payload) in input.iter() {
            assert!(output.push(conn, payload));
        }
        completions.send(Completion { input, output }).unwrap();
    }

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let remote = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (local, _) = listener.accept().unwrap();
        (local, remote)
    }

    /// A client/server session; returns the remote end of the server side.
    fn session(table: &mut ConnectionTable) -> (ConnId, ConnId, TcpStream, TcpStream) {
        let (client, client_remote) = loopback_pair();
        let (server, server_remote) = loopback_pair();
        let addr = client.peer_addr().unwrap();
        let c = table.insert(client, Role::Client, addr, true).unwrap();
        let s = table.insert(server, Role::Server, addr, true).unwrap();
        table.pair(c, s);
        server_remote
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        (c, s, client_remote, server_remote)
    }

    #[test]
    fn test_state_machine() {
        let (mut batch, submissions, completions) = coordinator(sizing(4, 64));
        let poll = Poll::new().unwrap();
        let mut table = ConnectionTable::new(poll.registry().try_clone().unwrap());
        let (c, _s, _cr, mut sr) = session(&mut table);

        assert_eq!(batch.state(), BatchState::Empty);
        assert!(!batch.has_new_result());

        let mut pending = BytesMut::from(&b"hello"[..]);
        assert!(batch.stage(c, &mut pending).unwrap());
        assert!(pending.is_empty());
        assert_eq!(batch.state(), BatchState::Filling);

        assert!(batch.try_submit().unwrap());
        assert_eq!(batch.state(), BatchState::Submitted);
        assert!(!batch.has_new_result());

        complete(&submissions, &completions);
        assert!(batch.has_new_result());
        assert_eq!(batch.state(), BatchState::Ready);
        // Repeated checks do not consume the result.
        assert!(batch.has_new_result());

        let report = batch.forward_completed(&mut table);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 0);
        assert_eq!(report.bytes, 5);
        assert!(report.failed.is_empty());
        assert_eq!(batch.state(), BatchState::Empty);
        assert!(!batch.has_new_result());

        let mut buf = [0u8; 5];
        sr.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_closed_connection_item_dropped() {
        let (mut batch, submissions, completions) = coordinator(sizing(4, 64));
        let poll = Poll::new().unwrap();
        let mut table = ConnectionTable::new(poll.registry().try_clone().unwrap());
        let (c1, s1, _cr1, _sr1) = session(&mut table);
        let (c2, _s2, _cr2, mut sr2) = session(&mut table);

        batch.stage(c1, &mut BytesMut::from(&b"gone"[..])).unwrap();
        batch.stage(c2, &mut BytesMut::from(&b"kept"[..])).unwrap();
        batch.try_submit().unwrap();

        // Session 1 closes while its item is in flight.
        table.remove(c1);
        table.remove(s1);

        complete(&submissions, &completions);
        assert!(batch.has_new_result());
        let report = batch.forward_completed(&mut table);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);
        assert!(report.failed.is_empty());

        let mut buf = [0u8; 4];
        sr2.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"kept");
    }

    #[test]
    fn test_one_generation_in_flight() {
        let (mut batch, submissions, completions) = coordinator(sizing(1, 64));
        let poll = Poll::new().unwrap();
        let mut table = ConnectionTable::new(poll.registry().try_clone().unwrap());
        let (c, _s, _cr, mut sr) = session(&mut table);

        // First item fills buffer A.
        assert!(batch.stage(c, &mut BytesMut::from(&b"a"[..])).unwrap());
        // Second item submits A and fills B.
        assert!(batch.stage(c, &mut BytesMut::from(&b"b"[..])).unwrap());
        assert_eq!(submissions.len(), 1);

        // Third item cannot go anywhere: B is full and A is in flight.
        let mut pending = BytesMut::from(&b"c"[..]);
        assert!(!batch.stage(c, &mut pending).unwrap());
        assert_eq!(&pending[..], b"c");
        assert_eq!(batch.backlog_len(), 1);
        assert!(!batch.try_submit().unwrap());
        assert_eq!(submissions.len(), 1);

        // The backlogged bytes live in the connection's receive buffer.
        table.get_mut(c).unwrap().recv_buf.extend_from_slice(&pending);

        complete(&submissions, &completions);
        assert!(batch.has_new_result());
        assert_eq!(batch.forward_completed(&mut table).delivered, 1);

        // Flush submits B, then the backlog fills A again.
        batch.flush(&mut table).unwrap();
        assert_eq!(submissions.len(), 1);
        assert_eq!(batch.backlog_len(), 0);
        assert!(table.get(c).unwrap().recv_buf.is_empty());
        assert_eq!(batch.filling_len(), 1);

        complete(&submissions, &completions);
        assert!(batch.has_new_result());
        batch.forward_completed(&mut table);
        batch.flush(&mut table).unwrap();
        complete(&submissions, &completions);
        assert!(batch.has_new_result());
        batch.forward_completed(&mut table);

        let mut buf = [0u8; 3];
        sr.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn test_items_split_by_max_item_size() {
        let mut sizing = sizing(8, 64);
        sizing.max_item_size = 3;
        let (mut batch, submissions, _completions) = coordinator(sizing);
        let id = ConnId::with_generation(0, 0);

        batch.stage(id, &mut BytesMut::from(&b"abcdefg"[..])).unwrap();
        assert_eq!(batch.filling_len(), 3);
        batch.try_submit().unwrap();
        let sub = submissions.try_recv().unwrap();
        let payloads: Vec<_> = sub.input.iter().map(|(_, p)| p.to_vec()).collect();
        assert_eq!(payloads, vec![b"abc".to_vec(), b"def".to_vec(), b"g".to_vec()]);
    }

    #[test]
    fn test_accelerator_gone_is_fatal() {
        let (mut batch, submissions, _completions) = coordinator(sizing(4, 64));
        drop(submissions);
        let id = ConnId::with_generation(0, 0);
        batch.stage(id, &mut BytesMut::from(&b"x"[..])).unwrap();
        assert!(matches!(
            batch.try_submit(),
            Err(WorkerError::AcceleratorGone { worker_id: 0 })
        ));
    }

    #[test]
    fn test_allocation_failure() {
        let (submit_tx, _submit_rx) = crossbeam_channel::unbounded();
        let (handle, _complete_tx) = BatchHandle::new(3, sizing(1, usize::MAX), submit_tx);
        assert!(matches!(
            BatchCoordinator::allocate(handle),
            Err(WorkerError::BufferAlloc { worker_id: 3, .. })
        ));
    }
}
