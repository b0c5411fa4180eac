//! Linux backend: epoll in edge-triggered mode.

use crate::{wait_result, ReadyEvent, MAX_EVENTS};
use std::io;
use std::os::unix::io::RawFd;

#[derive(Debug)]
pub struct Reactor {
    epfd: RawFd,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd })
    }

    /// Register `fd` for edge-triggered read readiness.
    pub fn register_read(&self, fd: RawFd) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLRDHUP) as u32,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Collect up to [`MAX_EVENTS`] ready handles into `out`.
    ///
    /// `out` is cleared first and reused across calls so the loop never
    /// allocates in steady state. A negative `timeout_ms` blocks.
    pub fn wait(&self, out: &mut Vec<ReadyEvent>, timeout_ms: i32) -> io::Result<usize> {
        let mut raw: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::epoll_wait(self.epfd, raw.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };
        let n = wait_result(rc)?;

        out.clear();
        for ev in raw.iter().take(n) {
            let flags = ev.events as i32;
            out.push(ReadyEvent {
                fd: ev.u64 as RawFd,
                readable: flags & libc::EPOLLIN != 0,
                closed: flags & (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) != 0,
            });
        }
        Ok(n)
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}
