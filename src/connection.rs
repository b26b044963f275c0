//! The `Connection` record and the write-arm tri-state (§3, §4.6, §4.8).

use crate::buffer::OutBuffer;
use crate::callback::Callbacks;
use crate::socket::AnySocket;
use std::time::{Duration, Instant};

/// Default per-connection idle timeout (§3, §6): 15 seconds.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Which side of the connection this record represents (§3 `role`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Outbound, not yet established (`CONNECTING` in §4.8).
    Connecting,
    /// Outbound, established — called "server" from the connection's view.
    Server,
    /// Inbound, accepted — called "client".
    Client,
}

/// Tri-state backend arming for a connection (§3 `writing`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteArm {
    Unarmed,
    ReadOnly,
    ReadWrite,
}

/// One active socket and everything the scheduler needs to drive it.
pub struct Connection {
    pub socket: AnySocket,
    pub role: Role,
    pub callbacks: Callbacks,
    pub out: OutBuffer,
    pub writing: WriteArm,
    pub read_only_pending: bool,
    pub finish_pending: bool,
    pub last_activity: Instant,
    pub idle_timeout: Duration,
    pub connect_start: Option<Instant>,
    /// For inbound connections: set once the accept pipeline has observed
    /// the socket as usable (§4.4 staging). For outbound connections this
    /// tracks the non-blocking connect completing (§4.5). Always `true`
    /// immediately for plain (non-TLS) sockets, since there is no
    /// handshake to wait on; a TLS layer plugged in later would leave this
    /// `false` until its handshake completes, and the existing staging /
    /// accept-timeout machinery would apply unchanged.
    pub connected: bool,
    pub tls: bool,
}

impl Connection {
    pub fn new(socket: AnySocket, role: Role, tls: bool, connected: bool) -> Self {
        let now = Instant::now();
        Self {
            socket,
            role,
            callbacks: Callbacks::default(),
            out: OutBuffer::new(),
            writing: WriteArm::Unarmed,
            read_only_pending: false,
            finish_pending: false,
            last_activity: now,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_start: if role == Role::Connecting { Some(now) } else { None },
            connected,
            tls,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}
