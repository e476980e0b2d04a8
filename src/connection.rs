//! Connections and the per-worker table that owns them.
//!
//! The poller never holds a reference to a [`Connection`]. Each registration
//! carries a token encoding the connection's slot, generation and role tag;
//! the event loop resolves the token through the [`ConnectionTable`], so a
//! readiness event that outlives its connection resolves to nothing instead of
//! to freed state.

use crate::metrics::{CONNECTIONS_ACTIVE, READS_PAUSED};
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::mem;
use std::net::SocketAddr;

const SLOT_MASK: u64 = 0xFFFF_FFFF;
const GENERATION_MASK: u64 = 0x00FF_FFFF;
const TAG_SHIFT: u32 = 56;
const ID_MASK: u64 = (1 << TAG_SHIFT) - 1;

// The role tag lives in the top byte of a `usize` token.
const _: () = assert!(usize::BITS >= 64, "poller tokens require a 64-bit target");

/// Buffered bytes at which a connection stops reading.
pub const DEFAULT_HIGH_WATER: usize = 4 * 1024 * 1024;

/// Which side of a proxied session a connection is.
///
/// Fixed at registration; selects the handler slot for every readiness event
/// on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Role {
    /// Accepted from a downstream client.
    Client = 1,
    /// Opened by the worker towards the backend.
    Server = 2,
}

impl Role {
    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Role {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(Role::Client),
            2 => Ok(Role::Server),
            other => Err(other),
        }
    }
}

/// Opaque connection identifier.
///
/// Encodes a slot index and a generation counter so a reused slot is never
/// confused with the connection that previously occupied it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    #[inline]
    pub(crate) fn with_generation(slot: usize, generation: u32) -> Self {
        Self((((generation as u64) & GENERATION_MASK) << 32) | (slot as u64 & SLOT_MASK))
    }

    /// Slot index in the owning table.
    #[inline]
    pub fn slot(&self) -> usize {
        (self.0 & SLOT_MASK) as usize
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Poller token for this connection, tagged with its role.
    #[inline]
    pub fn token(&self, role: Role) -> Token {
        Token(((role.tag() as u64) << TAG_SHIFT | self.0) as usize)
    }

    /// Split a poller token into the connection it names and its raw role tag.
    #[inline]
    pub fn from_token(token: Token) -> (ConnId, u8) {
        let raw = token.0 as u64;
        (ConnId(raw & ID_MASK), (raw >> TAG_SHIFT) as u8)
    }
}

/// A registered, non-blocking TCP connection.
pub struct Connection {
    id: ConnId,
    role: Role,
    /// Remote address.
    pub addr: SocketAddr,
    stream: TcpStream,
    /// Other half of the session, if any.
    pub peer: Option<ConnId>,
    /// Bytes read but not yet forwarded or staged.
    pub recv_buf: BytesMut,
    /// Bytes queued for this connection but not yet written.
    pub send_buf: BytesMut,
    /// False for an outbound connection until its connect completes.
    pub connected: bool,
}

impl Connection {
    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Read everything currently available into `recv_buf`.
    ///
    /// Returns the number of bytes read. End of stream is reported as
    /// `UnexpectedEof`, after any bytes read before it have been buffered.
    pub fn fill_recv(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; 16 * 1024];
        let mut total = 0;
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"));
                }
                Ok(n) => {
                    self.recv_buf.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Check if we have data to send.
    pub fn has_pending_send(&self) -> bool {
        !self.send_buf.is_empty()
    }

    /// Queue data to send.
    pub fn queue_send(&mut self, data: &[u8]) {
        self.send_buf.extend_from_slice(data);
    }

    /// Write queued data until the socket would block.
    ///
    /// Does nothing while an outbound connect is still in progress.
    pub fn flush(&mut self) -> io::Result<usize> {
        if !self.connected {
            return Ok(0);
        }
        let mut written = 0;
        while !self.send_buf.is_empty() {
            match self.stream.write(&self.send_buf) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    let _ = self.send_buf.split_to(n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// Complete an outbound connect on its first writable event.
    pub fn finish_connect(&mut self) -> io::Result<()> {
        if self.connected {
            return Ok(());
        }
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        // Still in progress if the peer address is not yet known.
        match self.stream.peer_addr() {
            Ok(_) => {
                self.connected = true;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }
}

struct Entry {
    conn: Connection,
    generation: u32,
}

/// Owned lookup table of a worker's live connections.
///
/// Also tracks two kinds of deferred work: connections whose reads are paused
/// until buffered bytes drain below the high-water mark, and connections that
/// reached end of stream and close once their output has been written.
pub struct ConnectionTable {
    registry: Registry,
    entries: Slab<Entry>,
    next_generation: u32,
    high_water: usize,
    paused: Vec<ConnId>,
    closing: Vec<ConnId>,
}

impl ConnectionTable {
    /// Create an empty table registering with `registry`.
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            entries: Slab::with_capacity(1024),
            next_generation: 0,
            high_water: DEFAULT_HIGH_WATER,
            paused: Vec::new(),
            closing: Vec::new(),
        }
    }

    /// Set the buffered byte count at which reads pause.
    pub fn with_high_water(mut self, bytes: usize) -> Self {
        self.high_water = bytes.max(1);
        self
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    fn over_high_water(&self, id: ConnId) -> bool {
        let Some(conn) = self.get(id) else {
            return false;
        };
        if conn.recv_buf.len() >= self.high_water {
            return true;
        }
        conn.peer
            .and_then(|peer| self.get(peer))
            .is_some_and(|peer| peer.send_buf.len() >= self.high_water)
    }

    /// Pause reads on `id` if its own receive buffer or its peer's send
    /// buffer is at the high-water mark.
    ///
    /// Returns true when the caller must not read. A paused connection is
    /// handed back by [`take_resumable`](Self::take_resumable) once both
    /// buffers have drained below the mark.
    pub fn pause_reads(&mut self, id: ConnId) -> bool {
        if !self.over_high_water(id) {
            return false;
        }
        READS_PAUSED.increment();
        if !self.paused.contains(&id) {
            self.paused.push(id);
        }
        true
    }

    /// Paused connections that may read again. Closed ones are forgotten.
    pub fn take_resumable(&mut self) -> Vec<ConnId> {
        if self.paused.is_empty() {
            return Vec::new();
        }
        let paused = mem::take(&mut self.paused);
        let (resume, still): (Vec<_>, Vec<_>) = paused
            .into_iter()
            .filter(|id| self.contains(*id))
            .partition(|id| !self.over_high_water(*id));
        self.paused = still;
        resume
    }

    /// Close `id` once nothing read from it is left to deliver.
    ///
    /// Used when a connection reaches end of stream while bytes it sent are
    /// still buffered for its peer.
    pub fn close_when_flushed(&mut self, id: ConnId) {
        if !self.closing.contains(&id) {
            self.closing.push(id);
        }
    }

    /// Connections marked by [`close_when_flushed`](Self::close_when_flushed)
    /// that are ready to close: their receive buffer is empty, the peer has
    /// written everything queued and `held` reports nothing else pending.
    /// Connections already gone are dropped from the list.
    pub fn take_flushed(&mut self, mut held: impl FnMut(ConnId) -> bool) -> Vec<ConnId> {
        if self.closing.is_empty() {
            return Vec::new();
        }
        let closing = mem::take(&mut self.closing);
        let (done, still): (Vec<_>, Vec<_>) = closing
            .into_iter()
            .filter(|id| self.contains(*id))
            .partition(|id| !self.has_undelivered(*id) && !held(*id));
        self.closing = still;
        done
    }

    /// Whether bytes read from `id` are still buffered on either side.
    pub fn has_undelivered(&self, id: ConnId) -> bool {
        let Some(conn) = self.get(id) else {
            return false;
        };
        !conn.recv_buf.is_empty()
            || conn
                .peer
                .and_then(|peer| self.get(peer))
                .is_some_and(Connection::has_pending_send)
    }

    /// Register a stream for read and write readiness.
    ///
    /// `connected` is false for outbound connects still in progress.
    pub fn insert(
        &mut self,
        stream: std::net::TcpStream,
        role: Role,
        addr: SocketAddr,
        connected: bool,
    ) -> io::Result<ConnId> {
        stream.set_nonblocking(true)?;
        let mut stream = TcpStream::from_std(stream);

        let entry = self.entries.vacant_entry();
        let generation = self.next_generation & GENERATION_MASK as u32;
        let id = ConnId::with_generation(entry.key(), generation);

        self.registry.register(
            &mut stream,
            id.token(role),
            Interest::READABLE | Interest::WRITABLE,
        )?;

        entry.insert(Entry {
            conn: Connection {
                id,
                role,
                addr,
                stream,
                peer: None,
                recv_buf: BytesMut::with_capacity(4096),
                send_buf: BytesMut::with_capacity(4096),
                connected,
            },
            generation,
        });
        self.next_generation = self.next_generation.wrapping_add(1);
        CONNECTIONS_ACTIVE.increment();

        Ok(id)
    }

    /// Link two connections as the halves of one session.
    pub fn pair(&mut self, a: ConnId, b: ConnId) {
        if let Some(conn) = self.get_mut(a) {
            conn.peer = Some(b);
        }
        if let Some(conn) = self.get_mut(b) {
            conn.peer = Some(a);
        }
    }

    /// Check whether `id` names a live connection.
    pub fn contains(&self, id: ConnId) -> bool {
        self.get(id).is_some()
    }

    /// Get a connection by ID.
    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.entries
            .get(id.slot())
            .filter(|e| e.generation == id.generation())
            .map(|e| &e.conn)
    }

    /// Get a mutable connection by ID.
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.entries
            .get_mut(id.slot())
            .filter(|e| e.generation == id.generation())
            .map(|e| &mut e.conn)
    }

    /// Deregister and remove a connection; dropping it closes the socket.
    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        if !self.contains(id) {
            return None;
        }
        let mut entry = self.entries.remove(id.slot());
        let _ = self.registry.deregister(&mut entry.conn.stream);
        CONNECTIONS_ACTIVE.decrement();
        Some(entry.conn)
    }

    /// Queue `data` on a connection and write as much as the socket accepts.
    pub fn send(&mut self, id: ConnId, data: &[u8]) -> io::Result<()> {
        let Some(conn) = self.get_mut(id) else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        };
        conn.queue_send(data);
        conn.flush().map(|_| ())
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;
    use std::net::TcpListener;

    fn loopback_pair() -> (std::net::TcpStream, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let remote = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (local, _) = listener.accept().unwrap();
        (local, remote)
    }

    #[test]
    fn test_token_round_trip() {
        let id = ConnId::with_generation(42, 7);
        for role in [Role::Client, Role::Server] {
            let (decoded, tag) = ConnId::from_token(id.token(role));
            assert_eq!(decoded, id);
            assert_eq!(Role::try_from(tag), Ok(role));
        }
    }

    #[test]
    fn test_unknown_role_tags() {
        assert_eq!(Role::try_from(0), Err(0));
        assert_eq!(Role::try_from(3), Err(3));
        assert_eq!(Role::try_from(0xFF), Err(0xFF));
    }

    #[test]
    fn test_generation_wraps_into_mask() {
        let id = ConnId::with_generation(1, u32::MAX);
        assert_eq!(id.generation(), GENERATION_MASK as u32);
        assert_eq!(id.slot(), 1);
        let (decoded, tag) = ConnId::from_token(id.token(Role::Server));
        assert_eq!(decoded, id);
        assert_eq!(tag, Role::Server.tag());
    }

    #[test]
    fn test_stale_id_does_not_resolve() {
        let poll = Poll::new().unwrap();
        let mut table = ConnectionTable::new(poll.registry().try_clone().unwrap());

        let (local, _remote) = loopback_pair();
        let addr = local.peer_addr().unwrap();
        let first = table.insert(local, Role::Client, addr, true).unwrap();
        assert!(table.remove(first).is_some());
        assert!(table.remove(first).is_none());

        let (local, _remote2) = loopback_pair();
        let second = table.insert(local, Role::Client, addr, true).unwrap();

        // Same slot, different generation.
        assert_eq!(first.slot(), second.slot());
        assert!(!table.contains(first));
        assert!(table.contains(second));
        assert_eq!(table.get(second).unwrap().role(), Role::Client);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_send_and_eof() {
        use std::io::{Read, Write};

        let poll = Poll::new().unwrap();
        let mut table = ConnectionTable::new(poll.registry().try_clone().unwrap());
        let (local, mut remote) = loopback_pair();
        let addr = local.peer_addr().unwrap();
        let id = table.insert(local, Role::Server, addr, true).unwrap();

        table.send(id, b"ping").unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        remote.write_all(b"pong").unwrap();
        drop(remote);
        // Give the kernel a moment to deliver data and FIN.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let conn = table.get_mut(id).unwrap();
        let err = conn.fill_recv().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(&conn.recv_buf[..], b"pong");
    }

    #[test]
    fn test_pairing() {
        let poll = Poll::new().unwrap();
        let mut table = ConnectionTable::new(poll.registry().try_clone().unwrap());
        let (a, _ra) = loopback_pair();
        let (b, _rb) = loopback_pair();
        let addr = a.peer_addr().unwrap();
        let client = table.insert(a, Role::Client, addr, true).unwrap();
        let server = table.insert(b, Role::Server, addr, false).unwrap();
        table.pair(client, server);
        assert_eq!(table.get(client).unwrap().peer, Some(server));
        assert_eq!(table.get(server).unwrap().peer, Some(client));
        assert!(!table.get(server).unwrap().connected);
    }

    #[test]
    fn test_role_tag_survives_full_width_id() {
        let id = ConnId::with_generation(SLOT_MASK as usize, GENERATION_MASK as u32);
        let token = id.token(Role::Server);
        assert_eq!(token.0 >> TAG_SHIFT, Role::Server.tag() as usize);
        assert_eq!(ConnId::from_token(token), (id, Role::Server.tag()));
    }

    #[test]
    fn test_reads_pause_until_peer_drains() {
        let poll = Poll::new().unwrap();
        let mut table = ConnectionTable::new(poll.registry().try_clone().unwrap())
            .with_high_water(16);
        let (a, _ra) = loopback_pair();
        let (b, _rb) = loopback_pair();
        let addr = a.peer_addr().unwrap();
        let client = table.insert(a, Role::Client, addr, true).unwrap();
        let server = table.insert(b, Role::Server, addr, false).unwrap();
        table.pair(client, server);

        assert!(!table.pause_reads(client));

        table.get_mut(server).unwrap().queue_send(&[0u8; 16]);
        assert!(table.pause_reads(client));
        assert!(table.pause_reads(client));
        assert!(table.take_resumable().is_empty());

        table.get_mut(server).unwrap().send_buf.clear();
        assert_eq!(table.take_resumable(), vec![client]);
        assert!(table.take_resumable().is_empty());

        // Own receive buffer counts too.
        table.get_mut(client).unwrap().recv_buf.extend_from_slice(&[1u8; 32]);
        assert!(table.pause_reads(client));
        table.remove(client);
        assert!(table.take_resumable().is_empty());
    }

    #[test]
    fn test_close_when_flushed() {
        let poll = Poll::new().unwrap();
        let mut table = ConnectionTable::new(poll.registry().try_clone().unwrap());
        let (a, _ra) = loopback_pair();
        let (b, _rb) = loopback_pair();
        let addr = a.peer_addr().unwrap();
        let client = table.insert(a, Role::Client, addr, true).unwrap();
        let server = table.insert(b, Role::Server, addr, false).unwrap();
        table.pair(client, server);

        // The server has not connected yet, so its queue cannot drain.
        table.get_mut(server).unwrap().queue_send(b"last");
        table.close_when_flushed(client);
        table.close_when_flushed(client);
        assert!(table.has_undelivered(client));
        assert!(table.take_flushed(|_| false).is_empty());

        table.get_mut(server).unwrap().send_buf.clear();
        assert!(table.take_flushed(|_| true).is_empty());
        assert_eq!(table.take_flushed(|_| false), vec![client]);
        assert!(table.take_flushed(|_| false).is_empty());
    }
}
