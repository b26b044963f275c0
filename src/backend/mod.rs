//! Readiness-backend abstraction.
//!
//! A uniform interface over the three OS readiness mechanisms the loop
//! knows about: a kernel-queue backend (kqueue, BSD family), an
//! epoll-style backend (Linux), and a portable `poll(2)` fallback. Exactly
//! one is chosen and constructed at [`Loop`](crate::Loop) construction
//! time, in priority order kernel-queue > epoll-style > poll, each gated
//! by an environment variable that forces a specific backend. kqueue
//! descriptors do not survive a `fork`, so callers must construct a
//! `Loop` (and therefore its backend) after forking, not before —
//! `select()` itself has no later "first use" point to defer to.

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;
#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
mod poll;

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// A single readiness result: an fd and the event bits observed on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
    /// Set by the kernel-queue backend when EOF arrived without an error
    /// condition attached; the scheduler treats this as hangup rather than
    /// error (see §4.7 dispatch ordering).
    pub eof_clean: bool,
}

/// The kind of backend in use, surfaced for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Kqueue,
    Epoll,
    Poll,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Kqueue => "kqueue",
            BackendKind::Epoll => "epoll",
            BackendKind::Poll => "poll",
        }
    }
}

/// Capability set every concrete backend implements: arm for reading,
/// arm for reading and writing, drop back to read-only, unregister, and
/// wait for readiness. Implementations must coalesce duplicate arms
/// (idempotent registration) and must tolerate unregistering an fd that
/// was never registered.
pub trait Backend {
    fn kind(&self) -> BackendKind;

    /// Register (or re-arm) `fd` for read interest only.
    fn arm_read(&mut self, fd: RawFd) -> io::Result<()>;

    /// Register (or re-arm) `fd` for read and write interest.
    fn arm_read_write(&mut self, fd: RawFd) -> io::Result<()>;

    /// Drop write interest on a previously read-write-armed `fd`, keeping
    /// read interest. Alias of [`arm_read`] at the call-site, but backends
    /// that track write interest per fd (kqueue) use this to know they
    /// must issue a delete for the write filter.
    fn arm_read_only(&mut self, fd: RawFd) -> io::Result<()> {
        self.arm_read(fd)
    }

    /// Remove `fd` from the interest set. Safe to call on an fd that was
    /// never registered, or already removed.
    fn unregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block for at most `timeout`, returning the set of fds that became
    /// ready. An empty result on timeout is not an error.
    fn wait(&mut self, timeout: Duration) -> io::Result<Vec<Readiness>>;
}

/// At most one force-backend environment variable is honored; priority of
/// the remaining backends is preserved when none is set (or the forced one
/// is unavailable on this platform).
fn forced_kind() -> Option<BackendKind> {
    if std::env::var_os("LOOP_FORCE_KQUEUE").is_some() {
        Some(BackendKind::Kqueue)
    } else if std::env::var_os("LOOP_FORCE_EPOLL").is_some() {
        Some(BackendKind::Epoll)
    } else if std::env::var_os("LOOP_FORCE_POLL").is_some() {
        Some(BackendKind::Poll)
    } else {
        None
    }
}

/// Construct the best available backend for this platform, honoring any
/// force-backend environment override. Falls through to the portable poll
/// backend if a forced, platform-unavailable choice is requested.
pub fn select() -> io::Result<Box<dyn Backend>> {
    let forced = forced_kind();

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    {
        if matches!(forced, None | Some(BackendKind::Kqueue)) {
            tracing::info!(backend = "kqueue", "selecting readiness backend");
            return Ok(Box::new(kqueue::Kqueue::new()?));
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        if matches!(forced, None | Some(BackendKind::Epoll)) {
            tracing::info!(backend = "epoll", "selecting readiness backend");
            return Ok(Box::new(epoll::Epoll::new()?));
        }
    }

    tracing::info!(backend = "poll", "selecting readiness backend");
    Ok(Box::new(poll::Poll::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_kind_reads_env() {
        // Exercised indirectly by backend-specific tests; this just checks
        // the precedence order is kqueue > epoll > poll.
        std::env::remove_var("LOOP_FORCE_KQUEUE");
        std::env::remove_var("LOOP_FORCE_EPOLL");
        std::env::remove_var("LOOP_FORCE_POLL");
        assert_eq!(forced_kind(), None);

        std::env::set_var("LOOP_FORCE_POLL", "1");
        assert_eq!(forced_kind(), Some(BackendKind::Poll));

        std::env::set_var("LOOP_FORCE_EPOLL", "1");
        assert_eq!(forced_kind(), Some(BackendKind::Epoll));

        std::env::set_var("LOOP_FORCE_KQUEUE", "1");
        assert_eq!(forced_kind(), Some(BackendKind::Kqueue));

        std::env::remove_var("LOOP_FORCE_KQUEUE");
        std::env::remove_var("LOOP_FORCE_EPOLL");
        std::env::remove_var("LOOP_FORCE_POLL");
    }
}
