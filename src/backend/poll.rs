//! Portable `poll(2)` backend, used when neither kqueue nor epoll is
//! available (or forced off via `LOOP_FORCE_POLL`). `O(n)` per wait in the
//! number of registered fds, traded for being available on every unix
//! target mio itself supports a poll fallback for.

use super::{Backend, BackendKind, Readiness};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct Poll {
    // fd -> whether write interest is armed. Order is not significant;
    // `wait` rebuilds the pollfd array fresh each call.
    fds: HashMap<RawFd, bool>,
}

impl Poll {
    pub fn new() -> Self {
        Self { fds: HashMap::new() }
    }
}

impl Backend for Poll {
    fn kind(&self) -> BackendKind {
        BackendKind::Poll
    }

    fn arm_read(&mut self, fd: RawFd) -> io::Result<()> {
        self.fds.insert(fd, false);
        Ok(())
    }

    fn arm_read_write(&mut self, fd: RawFd) -> io::Result<()> {
        self.fds.insert(fd, true);
        Ok(())
    }

    fn arm_read_only(&mut self, fd: RawFd) -> io::Result<()> {
        self.fds.insert(fd, false);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.fds.remove(&fd);
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<Vec<Readiness>> {
        if self.fds.is_empty() {
            // `poll(2)` with an empty set still sleeps for `timeout`,
            // which is the behavior the scheduler wants (housekeeping
            // cadence), so this is not special-cased further.
        }

        let order: Vec<RawFd> = self.fds.keys().copied().collect();
        let mut pollfds: Vec<libc::pollfd> = order
            .iter()
            .map(|&fd| libc::pollfd {
                fd,
                events: libc::POLLIN
                    | if self.fds[&fd] { libc::POLLOUT } else { 0 },
                revents: 0,
            })
            .collect();

        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        let n = loop {
            let ret = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, millis)
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
        for pfd in &pollfds {
            if pfd.revents == 0 {
                continue;
            }
            out.push(Readiness {
                fd: pfd.fd,
                readable: pfd.revents & libc::POLLIN != 0,
                writable: pfd.revents & libc::POLLOUT != 0,
                hangup: pfd.revents & libc::POLLHUP != 0,
                error: pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
                eof_clean: false,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::{AsRawFd, FromRawFd};

    #[test]
    fn arm_and_wait_on_a_pipe() {
        let mut fds = [0i32; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        let rd = unsafe { std::fs::File::from_raw_fd(fds[0]) };
        let mut wr = unsafe { std::fs::File::from_raw_fd(fds[1]) };

        let mut backend = Poll::new();
        backend.arm_read(rd.as_raw_fd()).unwrap();

        use std::io::Write;
        wr.write_all(b"x").unwrap();

        let events = backend.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].readable);

        backend.unregister(rd.as_raw_fd()).unwrap();
        backend.unregister(rd.as_raw_fd()).unwrap();
    }

    #[test]
    fn idempotent_duplicate_arms() {
        let mut backend = Poll::new();
        backend.arm_read(7).unwrap();
        backend.arm_read(7).unwrap();
        assert_eq!(backend.fds.len(), 1);
    }
}
