//! BSD/macOS backend: kqueue with EV_CLEAR (edge-triggered) read filters.

use crate::{wait_result, ReadyEvent, MAX_EVENTS};
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

#[derive(Debug)]
pub struct Reactor {
    kq: RawFd,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { kq })
    }

    fn change(&self, fd: RawFd, flags: u16) -> io::Result<()> {
        let ev = libc::kevent {
            ident: fd as libc::uintptr_t,
            filter: libc::EVFILT_READ,
            flags,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        };
        let rc = unsafe { libc::kevent(self.kq, &ev, 1, ptr::null_mut(), 0, ptr::null()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Register `fd` for edge-triggered read readiness.
    pub fn register_read(&self, fd: RawFd) -> io::Result<()> {
        self.change(fd, libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.change(fd, libc::EV_DELETE)
    }

    /// Collect up to [`MAX_EVENTS`] ready handles into `out`.
    ///
    /// `out` is cleared first and reused across calls so the loop never
    /// allocates in steady state. A negative `timeout_ms` blocks.
    pub fn wait(&self, out: &mut Vec<ReadyEvent>, timeout_ms: i32) -> io::Result<usize> {
        let mut raw: [libc::kevent; MAX_EVENTS] = unsafe { std::mem::zeroed() };

        let ts;
        let ts_ptr = if timeout_ms < 0 {
            ptr::null()
        } else {
            ts = libc::timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: (timeout_ms % 1000) as libc::c_long * 1_000_000,
            };
            &ts as *const libc::timespec
        };

        let rc = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                raw.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                ts_ptr,
            )
        };
        let n = wait_result(rc)?;

        out.clear();
        for ev in raw.iter().take(n) {
            out.push(ReadyEvent {
                fd: ev.ident as RawFd,
                readable: ev.filter == libc::EVFILT_READ,
                closed: ev.flags & (libc::EV_EOF | libc::EV_ERROR) != 0,
            });
        }
        Ok(n)
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}
