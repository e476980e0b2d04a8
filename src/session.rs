//! Session intake.
//!
//! Accepted client sockets reach a worker through its inbox. Admitting one
//! registers the client, opens a non-blocking connection to the backend and
//! pairs the two as one session.

use crate::connection::{ConnId, ConnectionTable, Role};
use crate::metrics::SESSIONS_ACCEPTED;
use crossbeam_channel::Receiver;
use std::io;
use std::net::{SocketAddr, TcpStream};
use tracing::{trace, warn};

/// A client socket accepted by the dispatcher.
#[derive(Debug)]
pub struct Session {
    pub stream: TcpStream,
    pub addr: SocketAddr,
}

/// A worker's end of the session queue.
pub struct SessionIntake {
    inbox: Receiver<Session>,
    backend: SocketAddr,
}

impl SessionIntake {
    pub fn new(inbox: Receiver<Session>, backend: SocketAddr) -> Self {
        Self { inbox, backend }
    }

    /// Admit every queued session without blocking. Returns how many were
    /// registered.
    pub fn admit(&self, conns: &mut ConnectionTable) -> usize {
        let mut admitted = 0;
        while let Ok(session) = self.inbox.try_recv() {
            let addr = session.addr;
            match self.open(conns, session) {
                Ok((client, server)) => {
                    SESSIONS_ACCEPTED.increment();
                    trace!(client = ?client, server = ?server, address = %addr, "Session admitted");
                    admitted += 1;
                }
                Err(e) => {
                    warn!(address = %addr, backend = %self.backend, error = %e, "Dropped session");
                }
            }
        }
        admitted
    }

    fn open(&self, conns: &mut ConnectionTable, session: Session) -> io::Result<(ConnId, ConnId)> {
        session.stream.set_nodelay(true)?;
        let client = conns.insert(session.stream, Role::Client, session.addr, true)?;

        let server = connect_backend(self.backend).and_then(|stream| {
            conns.insert(stream, Role::Server, self.backend, false)
        });
        let server = match server {
            Ok(server) => server,
            Err(e) => {
                conns.remove(client);
                return Err(e);
            }
        };

        conns.pair(client, server);
        Ok((client, server))
    }
}

/// Start a non-blocking connect; completion is observed on the first
/// writable event.
pub fn connect_backend(addr: SocketAddr) -> io::Result<TcpStream> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;
    use std::net::TcpListener;

    #[test]
    fn test_admit_pairs_client_with_backend() {
        let backend = TcpListener::bind("127.0.0.1:0").unwrap();
        let front = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(front.local_addr().unwrap()).unwrap();
        let (stream, addr) = front.accept().unwrap();

        let (tx, rx) = crossbeam_channel::bounded(4);
        tx.send(Session { stream, addr }).unwrap();
        let intake = SessionIntake::new(rx, backend.local_addr().unwrap());

        let poll = Poll::new().unwrap();
        let mut conns = ConnectionTable::new(poll.registry().try_clone().unwrap());
        assert_eq!(intake.admit(&mut conns), 1);
        assert_eq!(conns.len(), 2);

        // Empty inbox admits nothing.
        assert_eq!(intake.admit(&mut conns), 0);
        backend.accept().unwrap();
    }

    #[test]
    fn test_unreachable_backend_drops_client() {
        // Bind then drop to get a port nothing listens on.
        let dead = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let front = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(front.local_addr().unwrap()).unwrap();
        let (stream, addr) = front.accept().unwrap();

        let (tx, rx) = crossbeam_channel::bounded(4);
        tx.send(Session { stream, addr }).unwrap();
        let intake = SessionIntake::new(rx, dead);

        let poll = Poll::new().unwrap();
        let mut conns = ConnectionTable::new(poll.registry().try_clone().unwrap());
        // A refused loopback connect may surface immediately or on the first
        // writable event; either way the client never outlives its backend.
        let admitted = intake.admit(&mut conns);
        assert!(admitted == 0 && conns.is_empty() || admitted == 1 && conns.len() == 2);
    }
}
