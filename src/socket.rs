//! A small enum wrapping the two stream socket kinds the loop operates on,
//! so the rest of the crate can stay agnostic to TCP vs UNIX-domain.
//! Mirrors how the teacher wraps `mio::net::TcpStream` directly in
//! `MioConnection`, generalized to the second socket kind the spec's
//! `file` listen option calls for.

use mio::net::{TcpStream, UnixStream};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

/// Either side of a stream connection: TCP or UNIX-domain.
pub enum AnySocket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// Address info surfaced by `local_info`/`remote_info` (see §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: String,
    pub port: u16,
}

impl AnySocket {
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            AnySocket::Tcp(s) => s.read(buf),
            AnySocket::Unix(s) => s.read(buf),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            AnySocket::Tcp(s) => s.write(buf),
            AnySocket::Unix(s) => s.write(buf),
        }
    }

    /// `SO_ERROR`, used by the connect pipeline to tell a still-pending
    /// non-blocking connect apart from one that failed.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            AnySocket::Tcp(s) => s.take_error(),
            AnySocket::Unix(s) => s.take_error(),
        }
    }

    /// Whether a non-blocking connect has completed: no pending error and
    /// the peer address now resolves.
    pub fn connect_completed(&self) -> io::Result<bool> {
        if self.take_error()?.is_some() {
            return Ok(false);
        }
        Ok(self.peer_info().is_ok())
    }

    pub fn local_info(&self) -> io::Result<PeerInfo> {
        match self {
            AnySocket::Tcp(s) => s.local_addr().map(|a| PeerInfo {
                address: a.ip().to_string(),
                port: a.port(),
            }),
            AnySocket::Unix(s) => s.local_addr().map(|a| PeerInfo {
                address: a
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "unix".to_string()),
                port: 0,
            }),
        }
    }

    pub fn peer_info(&self) -> io::Result<PeerInfo> {
        match self {
            AnySocket::Tcp(s) => s.peer_addr().map(|a| PeerInfo {
                address: a.ip().to_string(),
                port: a.port(),
            }),
            AnySocket::Unix(s) => s.peer_addr().map(|a| PeerInfo {
                address: a
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "unix".to_string()),
                port: 0,
            }),
        }
    }
}

impl AsRawFd for AnySocket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            AnySocket::Tcp(s) => s.as_raw_fd(),
            AnySocket::Unix(s) => s.as_raw_fd(),
        }
    }
}
