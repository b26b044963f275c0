//! Accept Pipeline (§4.4): stages freshly accepted sockets until they
//! report `connected`, subject to `accept_timeout`, then arms them for
//! reading.
//!
//! Grounded on the teacher's `accept_connections` (`runtime/mio/
//! event_loop.rs`): drain-until-`WouldBlock` accept loop, immediate
//! registration with the backend, per-connection bookkeeping. The staging
//! step itself has no teacher counterpart (the teacher has no TLS
//! handshake to wait out) — it is a direct, unembellished implementation of
//! spec §4.4's literal "push (socket, now) onto the accept-staging list"
//! rule, which exists so a TLS layer plugged in later can delay
//! `connected` until its handshake finishes.

use crate::connection::{Connection, Role};
use crate::error::LoopError;
use crate::registry::ConnId;
use std::time::{Duration, Instant};

/// One socket accepted but not yet confirmed usable, plus when it was
/// staged (for the accept-timeout check).
#[derive(Default)]
pub struct AcceptPipeline {
    staged: Vec<(ConnId, Instant)>,
}

impl AcceptPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&mut self, id: ConnId) {
        self.staged.push((id, Instant::now()));
    }

    /// Housekeeping pass (§4.4 paragraph 2): for each staged connection,
    /// drop it with `AcceptTimeout` if it has overstayed; otherwise, once
    /// `connected`, hand it back to the caller to arm read-only and drop it
    /// from staging. Returns `(timed_out, ready)` ids; the caller owns the
    /// registry so it performs the actual drop/arm.
    pub fn housekeeping(
        &mut self,
        lookup: impl Fn(ConnId) -> Option<bool>,
        accept_timeout: Duration,
    ) -> (Vec<ConnId>, Vec<ConnId>) {
        let mut timed_out = Vec::new();
        let mut ready = Vec::new();
        self.staged.retain(|&(id, staged_at)| match lookup(id) {
            None => false, // already gone (e.g. dropped by an error handler)
            Some(true) => {
                ready.push(id);
                false
            }
            Some(false) => {
                if staged_at.elapsed() >= accept_timeout {
                    timed_out.push(id);
                    false
                } else {
                    true
                }
            }
        });
        (timed_out, ready)
    }
}

/// The error reported when a staged socket never completes (§7 `AcceptTimeout`).
pub fn accept_timeout_error() -> LoopError {
    LoopError::AcceptTimeout
}

pub fn new_inbound_connection(socket: crate::socket::AnySocket, tls: bool) -> Connection {
    Connection::new(socket, Role::Client, tls, !tls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use crate::socket::AnySocket;
    use mio::net::TcpStream;
    use std::net::TcpListener as StdListener;
    use std::os::unix::io::AsRawFd;

    fn dummy() -> (ConnId, ConnectionRegistry) {
        let mut reg = ConnectionRegistry::new();
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        let fd = stream.as_raw_fd();
        let id = reg.insert(fd, new_inbound_connection(AnySocket::Tcp(stream), false));
        (id, reg)
    }

    #[test]
    fn staged_without_timeout_stays_staged() {
        let (id, reg) = dummy();
        let mut pipeline = AcceptPipeline::new();
        pipeline.stage(id);

        let (timed_out, ready) =
            pipeline.housekeeping(|i| reg.get(i).map(|c| c.connected), Duration::from_secs(5));
        assert!(timed_out.is_empty());
        // Plain (non-TLS) sockets are connected immediately.
        assert_eq!(ready, vec![id]);
    }

    #[test]
    fn overstaying_without_connecting_times_out() {
        let mut reg = ConnectionRegistry::new();
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        let fd = stream.as_raw_fd();
        let id = reg.insert(fd, new_inbound_connection(AnySocket::Tcp(stream), true));

        let mut pipeline = AcceptPipeline::new();
        pipeline.stage(id);
        std::thread::sleep(Duration::from_millis(5));

        let (timed_out, ready) =
            pipeline.housekeeping(|i| reg.get(i).map(|c| c.connected), Duration::from_millis(1));
        assert_eq!(timed_out, vec![id]);
        assert!(ready.is_empty());
    }

    #[test]
    fn vanished_connection_drops_from_staging_silently() {
        let (id, mut reg) = dummy();
        let mut pipeline = AcceptPipeline::new();
        pipeline.stage(id);
        reg.remove(id);

        let (timed_out, ready) =
            pipeline.housekeeping(|i| reg.get(i).map(|c| c.connected), Duration::from_secs(5));
        assert!(timed_out.is_empty());
        assert!(ready.is_empty());
    }
}
