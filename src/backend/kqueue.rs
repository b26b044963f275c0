//! kernel-queue backend (kqueue, BSD family including macOS).
//!
//! Modeled on mio's `sys/unix/selector/kqueue.rs`: a changelist of
//! `EV_ADD`/`EV_DELETE` kevents submitted alongside the wait call,
//! `EV_CLEAR` for edge-triggered semantics, and `EV_EOF`/`fflags` used to
//! tell a clean close apart from an error (see §4.7: "EOF with a flag set
//! => error, without => hangup").

use super::{Backend, BackendKind, Readiness};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct Kqueue {
    kq: RawFd,
    // Whether EVFILT_WRITE is currently armed for a given fd, so
    // `arm_read_only` knows whether it must issue an EV_DELETE.
    write_armed: HashMap<RawFd, bool>,
    events: Vec<libc::kevent>,
}

fn kevent_new(ident: RawFd, filter: i16, flags: u16) -> libc::kevent {
    libc::kevent {
        ident: ident as usize,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: std::ptr::null_mut(),
    }
}

fn submit(kq: RawFd, changes: &mut [libc::kevent]) -> io::Result<()> {
    if changes.is_empty() {
        return Ok(());
    }
    let ret = unsafe {
        libc::kevent(
            kq,
            changes.as_ptr(),
            changes.len() as libc::c_int,
            std::ptr::null_mut(),
            0,
            std::ptr::null(),
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        // ENOENT on an EV_DELETE for a filter that was never armed is
        // expected when disarming write-only; treat it as success.
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

impl Kqueue {
    pub fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe { libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC) };
        Ok(Self {
            kq,
            write_armed: HashMap::new(),
            events: vec![kevent_new(0, 0, 0); 1024],
        })
    }
}

impl Backend for Kqueue {
    fn kind(&self) -> BackendKind {
        BackendKind::Kqueue
    }

    fn arm_read(&mut self, fd: RawFd) -> io::Result<()> {
        let mut changes = [kevent_new(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_CLEAR)];
        submit(self.kq, &mut changes)?;
        self.write_armed.insert(fd, false);
        Ok(())
    }

    fn arm_read_write(&mut self, fd: RawFd) -> io::Result<()> {
        let mut changes = [
            kevent_new(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_CLEAR),
            kevent_new(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_CLEAR),
        ];
        submit(self.kq, &mut changes)?;
        self.write_armed.insert(fd, true);
        Ok(())
    }

    fn arm_read_only(&mut self, fd: RawFd) -> io::Result<()> {
        if self.write_armed.get(&fd).copied().unwrap_or(false) {
            let mut changes = [kevent_new(fd, libc::EVFILT_WRITE, libc::EV_DELETE)];
            submit(self.kq, &mut changes)?;
        }
        self.write_armed.insert(fd, false);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        let was_write_armed = self.write_armed.remove(&fd).unwrap_or(false);
        let mut changes = vec![kevent_new(fd, libc::EVFILT_READ, libc::EV_DELETE)];
        if was_write_armed {
            changes.push(kevent_new(fd, libc::EVFILT_WRITE, libc::EV_DELETE));
        }
        submit(self.kq, &mut changes)
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<Vec<Readiness>> {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };

        let n = loop {
            let ret = unsafe {
                libc::kevent(
                    self.kq,
                    std::ptr::null(),
                    0,
                    self.events.as_mut_ptr(),
                    self.events.len() as libc::c_int,
                    &ts,
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

        // Merge read/write kevents for the same fd into one Readiness, the
        // way the scheduler expects (one (fd, bits) entry per backend.wait
        // result per the public contract in §4.1).
        let mut merged: HashMap<RawFd, Readiness> = HashMap::new();
        for ev in &self.events[..n] {
            let fd = ev.ident as RawFd;
            let entry = merged.entry(fd).or_insert(Readiness {
                fd,
                readable: false,
                writable: false,
                hangup: false,
                error: false,
                eof_clean: false,
            });

            let is_error = (ev.flags & libc::EV_ERROR as u16) != 0;
            let is_eof = (ev.flags & libc::EV_EOF as u16) != 0;

            match ev.filter {
                f if f == libc::EVFILT_READ => entry.readable = true,
                f if f == libc::EVFILT_WRITE => entry.writable = true,
                _ => {}
            }

            if is_error || (is_eof && ev.fflags != 0) {
                entry.error = true;
            } else if is_eof {
                entry.hangup = true;
                entry.eof_clean = true;
            }
        }
        Ok(merged.into_values().collect())
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
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

        let mut backend = Kqueue::new().unwrap();
        backend.arm_read(rd.as_raw_fd()).unwrap();

        use std::io::Write;
        wr.write_all(b"x").unwrap();

        let events = backend.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].readable);

        backend.unregister(rd.as_raw_fd()).unwrap();
        backend.unregister(rd.as_raw_fd()).unwrap();
    }
}
