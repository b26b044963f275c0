//! epoll-style backend (Linux, Android).
//!
//! Modeled directly on mio's own epoll selector
//! (`sys/unix/selector/epoll.rs`): one `epoll_create1` fd, level-triggered
//! `EPOLLIN`/`EPOLLOUT` registrations keyed by the fd itself (we use the
//! fd as `u64` user data rather than a separate token, since the registry
//! already maps fd -> connection id).

use super::{Backend, BackendKind, Readiness};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct Epoll {
    epfd: RawFd,
    // epoll_ctl(MOD) requires knowing the previous interest set; track it
    // per fd the same way the kqueue backend tracks write interest.
    write_armed: HashMap<RawFd, bool>,
    events: Vec<libc::epoll_event>,
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { cvt(libc::epoll_create1(libc::EPOLL_CLOEXEC))? };
        Ok(Self {
            epfd,
            write_armed: HashMap::new(),
            events: vec![unsafe { std::mem::zeroed() }; 1024],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, writable: bool) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest_bits(writable),
            u64: fd as u64,
        };
        unsafe { cvt(libc::epoll_ctl(self.epfd, op, fd, &mut ev))? };
        Ok(())
    }
}

fn interest_bits(writable: bool) -> u32 {
    let mut bits = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    if writable {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

impl Backend for Epoll {
    fn kind(&self) -> BackendKind {
        BackendKind::Epoll
    }

    fn arm_read(&mut self, fd: RawFd) -> io::Result<()> {
        let op = if self.write_armed.contains_key(&fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.ctl(op, fd, false)?;
        self.write_armed.insert(fd, false);
        Ok(())
    }

    fn arm_read_write(&mut self, fd: RawFd) -> io::Result<()> {
        let op = if self.write_armed.contains_key(&fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.ctl(op, fd, true)?;
        self.write_armed.insert(fd, true);
        Ok(())
    }

    fn arm_read_only(&mut self, fd: RawFd) -> io::Result<()> {
        // Only issue a MOD when write interest was actually set; otherwise
        // this is already read-only and the call is a no-op (idempotence).
        if self.write_armed.get(&fd).copied().unwrap_or(true) {
            self.arm_read(fd)
        } else {
            Ok(())
        }
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        if self.write_armed.remove(&fd).is_none() {
            return Ok(());
        }
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Already gone (closed fd) is not an error from our perspective.
            if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<Vec<Readiness>> {
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        let n = loop {
            let ret = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    self.events.as_mut_ptr(),
                    self.events.len() as i32,
                    millis,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            break ret as usize;
        };

        let mut out = Vec::with_capacity(n);
        for ev in &self.events[..n] {
            let bits = ev.events as libc::c_int;
            out.push(Readiness {
                fd: ev.u64 as RawFd,
                readable: bits & libc::EPOLLIN != 0,
                writable: bits & libc::EPOLLOUT != 0,
                hangup: bits & libc::EPOLLHUP != 0 || bits & libc::EPOLLRDHUP != 0,
                error: bits & libc::EPOLLERR != 0,
                eof_clean: false,
            });
        }
        Ok(out)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn arm_and_wait_on_a_pipe() {
        let (mut rd, mut wr) = pipe();
        let mut backend = Epoll::new().unwrap();
        backend.arm_read(rd.as_raw_fd()).unwrap();

        use std::io::Write;
        wr.write_all(b"x").unwrap();

        let events = backend.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].readable);

        backend.unregister(rd.as_raw_fd()).unwrap();
        // Idempotent: unregistering twice must not error.
        backend.unregister(rd.as_raw_fd()).unwrap();
        let _ = &mut rd;
    }

    fn pipe() -> (std::fs::File, std::fs::File) {
        use std::os::unix::io::FromRawFd;
        let mut fds = [0i32; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        unsafe { (std::fs::File::from_raw_fd(fds[0]), std::fs::File::from_raw_fd(fds[1])) }
    }
}
