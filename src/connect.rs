//! Connect Pipeline (§4.5): drives outbound connections to completion
//! under `connect_timeout`, transitioning CONNECTING -> ESTABLISHED.
//!
//! Grounded on the teacher's listener construction in
//! `create_listener_with_reuseport` (`runtime/mio/event_loop.rs`) for the
//! "build a `socket2::Socket`, tune it, hand it to mio" shape, applied here
//! to the client side: a non-blocking connect that the I/O Scheduler polls
//! for completion rather than blocking on, exactly mirroring how the
//! teacher never blocks in its accept path either.

use crate::error::LoopError;
use crate::registry::ConnId;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Build a non-blocking TCP socket and begin connecting to `addr`,
/// returning it immediately (possibly still `EINPROGRESS`), the way
/// `connect(2)` on a non-blocking fd always does.
pub fn connect_tcp_nonblocking(addr: SocketAddr) -> io::Result<mio::net::TcpStream> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        // EINPROGRESS surfaces as this on most platforms for a non-blocking connect.
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }
    Ok(mio::net::TcpStream::from_std(socket.into()))
}

pub fn connect_unix_nonblocking(path: &str) -> io::Result<mio::net::UnixStream> {
    mio::net::UnixStream::connect(path)
}

/// Housekeeping pass over every `Role::Connecting` record (§4.5): returns
/// the ids that just became established and the ids that timed out. The
/// caller (which owns the registry) performs the actual state flips.
pub fn housekeeping(
    connecting: &[ConnId],
    mut connect_completed: impl FnMut(ConnId) -> Option<bool>,
    mut elapsed_since_start: impl FnMut(ConnId) -> Duration,
    connect_timeout: Duration,
) -> (Vec<ConnId>, Vec<ConnId>) {
    let mut established = Vec::new();
    let mut timed_out = Vec::new();
    for &id in connecting {
        match connect_completed(id) {
            None => continue, // already gone
            Some(true) => established.push(id),
            Some(false) => {
                if elapsed_since_start(id) >= connect_timeout {
                    timed_out.push(id);
                }
            }
        }
    }
    (established, timed_out)
}

pub fn connect_timeout_error() -> LoopError {
    LoopError::ConnectTimeout
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn connects_to_a_loopback_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = connect_tcp_nonblocking(addr).unwrap();
        // Give the kernel a moment; loopback connects are effectively
        // instantaneous but not guaranteed synchronous.
        std::thread::sleep(Duration::from_millis(20));
        assert!(stream.peer_addr().is_ok() || stream.take_error().unwrap().is_none());
    }

    #[test]
    fn housekeeping_reports_timeouts_for_unresolved_entries() {
        let id_list = vec![];
        let (established, timed_out) = housekeeping(
            &id_list,
            |_| Some(false),
            |_| Duration::from_secs(10),
            Duration::from_secs(5),
        );
        assert!(established.is_empty());
        assert!(timed_out.is_empty());
    }
}
